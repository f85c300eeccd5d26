//! Web App - Conversational UI grounded on the search data store.
//!
//! Each browser gets a session cookie. The first page load for a session
//! creates its chat (a Gemini model bound to a Vertex AI Search retrieval
//! tool); later loads render the transcript and accept new messages.

mod page;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use shared::http::shutdown_signal;
use shared::models::MAX_MESSAGE_CHARS;
use shared::vertex::GenerationConfig;
use shared::{
    ApiResponse, ChatRequest, ChatResponse, CredentialSource, Error, HistoryResponse,
    ModelFactory, ModelSettings, ServerConfig, SessionStore, TokenProvider, VertexModelFactory,
    WebConfig,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use validator::Validate;

const SESSION_COOKIE: &str = "sid";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Application state shared across requests.
struct AppState {
    config: WebConfig,
    sessions: Arc<SessionStore>,
}

/// Chat form posted by the page.
#[derive(Debug, Deserialize, Validate)]
struct PromptForm {
    #[validate(length(max = MAX_MESSAGE_CHARS))]
    #[serde(default)]
    prompt: String,
}

/// Reuse the browser's session id, or issue a new one.
fn session_cookie(jar: CookieJar) -> (CookieJar, String) {
    if let Some(id) = jar
        .get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .filter(|id| Uuid::parse_str(id).is_ok())
    {
        return (jar, id);
    }

    let id = Uuid::new_v4().to_string();
    let cookie = Cookie::build((SESSION_COOKIE, id.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);
    (jar.add(cookie), id)
}

async fn index(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<(CookieJar, Html<String>), Error> {
    let (jar, session_id) = session_cookie(jar);
    let session = state.sessions.get_or_create(&session_id).await?;
    let turns = SessionStore::history(&session).await;

    Ok((
        jar,
        Html(page::render_chat_page(
            &state.config.page_title,
            &state.config.header_title,
            &turns,
            None,
        )),
    ))
}

async fn submit_prompt(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<PromptForm>,
) -> Result<Response, Error> {
    let (jar, session_id) = session_cookie(jar);
    let session = state.sessions.get_or_create(&session_id).await?;

    if let Err(e) = form.validate() {
        warn!(session_id = %session_id, error = %e, "Rejected chat form");
        let turns = SessionStore::history(&session).await;
        let notice = format!(
            "Messages are limited to {} characters. Please shorten yours and try again.",
            MAX_MESSAGE_CHARS
        );
        let page = page::render_chat_page(
            &state.config.page_title,
            &state.config.header_title,
            &turns,
            Some(&notice),
        );
        return Ok((StatusCode::BAD_REQUEST, jar, Html(page)).into_response());
    }

    state.sessions.submit_message(&session, &form.prompt).await;

    Ok((jar, Redirect::to("/")).into_response())
}

async fn chat(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<ChatRequest>,
) -> Result<(CookieJar, Json<ApiResponse<ChatResponse>>), Error> {
    request.validate()?;

    let (jar, session_id) = session_cookie(jar);
    let session = state.sessions.get_or_create(&session_id).await?;
    let reply = state.sessions.submit_message(&session, &request.message).await;
    let turns = SessionStore::history(&session).await;

    Ok((jar, Json(ApiResponse::success(ChatResponse { reply, turns }))))
}

async fn history(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<ApiResponse<HistoryResponse>>), Error> {
    let (jar, session_id) = session_cookie(jar);
    let session = state.sessions.get_or_create(&session_id).await?;
    let turns = SessionStore::history(&session).await;

    Ok((
        jar,
        Json(ApiResponse::success(HistoryResponse { session_id, turns })),
    ))
}

async fn reset(State(state): State<Arc<AppState>>, jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.remove(cookie.value()).await;
    }
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        Redirect::to("/"),
    )
}

async fn health() -> &'static str {
    "ok"
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index).post(submit_prompt))
        .route("/reset", post(reset))
        .route("/api/chat", post(chat))
        .route("/api/history", get(history))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn model_settings(config: &WebConfig) -> ModelSettings {
    ModelSettings {
        project_id: config.project_id.clone(),
        region: config.region.clone(),
        model_id: config.model_id.clone(),
        data_store_path: config.data_store_path(),
        generation: GenerationConfig::default(),
        safety: config.safety,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = WebConfig::from_env()?;
    let server = ServerConfig::from_env(DEFAULT_TIMEOUT_SECS)?;
    info!(
        project_id = %config.project_id,
        region = %config.region,
        data_store = %config.data_store_path(),
        model_id = %config.model_id,
        max_message_chars = MAX_MESSAGE_CHARS,
        "Web app configured"
    );

    let http_client = reqwest::Client::builder()
        .timeout(server.remote.timeout())
        .build()?;
    let tokens = Arc::new(TokenProvider::new(
        CredentialSource::from_env()?,
        http_client.clone(),
    ));
    let factory: Arc<dyn ModelFactory> = Arc::new(VertexModelFactory::new(
        http_client,
        tokens,
        model_settings(&config),
        server.remote.retry_policy(),
    ));

    let sessions = Arc::new(SessionStore::new(factory));
    let sweeper = Arc::clone(&sessions).spawn_sweeper(config.session_ttl(), SWEEP_INTERVAL);

    let app = router(Arc::new(AppState {
        config,
        sessions: Arc::clone(&sessions),
    }));

    let listener = tokio::net::TcpListener::bind(server.bind_addr()).await?;
    info!(addr = %server.bind_addr(), "Web app listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    warn!(
        sessions = sessions.session_count().await,
        "Web app stopped; in-memory chat sessions discarded"
    );
    Ok(())
}
