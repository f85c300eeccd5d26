//! Loader App - Triggers a bulk document import into the search data store.
//!
//! Any request to `/` builds an incremental import from the configured Cloud
//! Storage URIs into the data store's default branch and submits it. The
//! import runs remotely; this service only logs the operation and returns.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Deserialize;
use shared::config::ConfigError;
use shared::http::shutdown_signal;
use shared::{
    ApiResponse, CredentialSource, DocumentService, DocumentServiceClient, Error, ImportAck,
    ImportDocumentsRequest, LoaderConfig, Operation, ServerConfig, TokenProvider,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Application state shared across requests.
struct AppState {
    /// Kept even when invalid so every request can report the problem
    config: Result<LoaderConfig, ConfigError>,
    documents: Arc<dyn DocumentService>,
}

impl AppState {
    fn config(&self) -> Result<&LoaderConfig, Error> {
        self.config.as_ref().map_err(|e| {
            error!(error = %e, "Rejecting request: loader is not configured");
            Error::from(e.clone())
        })
    }
}

#[derive(Debug, Deserialize)]
struct OperationQuery {
    name: String,
}

async fn import_documents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<ImportAck>>, Error> {
    let config = state.config()?;

    info!(
        project_id = %config.project_id,
        data_store_id = %config.data_store_id,
        gcs_uris = ?config.gcs_uris,
        "Starting document import"
    );

    let request =
        ImportDocumentsRequest::incremental_content(config.branch_path(), config.gcs_uris.clone());

    let operation = state
        .documents
        .import_documents(&request)
        .await
        .map_err(|e| {
            error!(error = %e, parent = %request.parent, "Import submission failed");
            e
        })?;

    let metadata = operation.import_metadata();
    info!(
        operation = %operation.name,
        metadata = ?metadata,
        "Import submitted; not waiting for completion"
    );

    Ok(Json(ApiResponse::success(ImportAck {
        operation_name: operation.name,
        metadata,
    })))
}

/// One-off status check for an import started earlier.
async fn operation_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OperationQuery>,
) -> Result<Json<ApiResponse<Operation>>, Error> {
    let config = state.config()?;

    let name = query.name.trim();
    let scope = format!("/dataStores/{}/", config.data_store_id);
    if !name.starts_with("projects/") || !name.contains(&scope) || !name.contains("/operations/")
    {
        return Err(Error::Validation(format!(
            "'{}' is not an operation of data store {}",
            name, config.data_store_id
        )));
    }

    let operation = state.documents.get_operation(name).await.map_err(|e| {
        error!(error = %e, operation = %name, "Operation lookup failed");
        e
    })?;

    info!(operation = %operation.name, done = operation.done, "Operation status fetched");
    Ok(Json(ApiResponse::success(operation)))
}

async fn health() -> &'static str {
    "ok"
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(import_documents))
        .route("/operations", get(operation_status))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = LoaderConfig::from_env();
    match &config {
        Ok(config) => info!(
            project_id = %config.project_id,
            data_store_id = %config.data_store_id,
            "Loader configured"
        ),
        Err(e) => error!(error = %e, "Loader configuration incomplete; imports will be rejected"),
    }

    let server = ServerConfig::from_env(DEFAULT_TIMEOUT_SECS)?;
    let http_client = reqwest::Client::builder()
        .timeout(server.remote.timeout())
        .build()?;
    let tokens = Arc::new(TokenProvider::new(
        CredentialSource::from_env()?,
        http_client.clone(),
    ));
    let documents = Arc::new(DocumentServiceClient::new(
        http_client,
        tokens,
        shared::config::LOCATION,
        server.remote.retry_policy(),
    ));

    let app = router(Arc::new(AppState { config, documents }));

    let listener = tokio::net::TcpListener::bind(server.bind_addr()).await?;
    info!(addr = %server.bind_addr(), "Loader listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::Value;
    use shared::discovery::ReconciliationMode;
    use std::sync::Mutex;
    use tower::util::ServiceExt;

    const OPERATION: &str = "projects/123/locations/global/collections/default_collection/dataStores/ds1/branches/0/operations/import-documents-42";

    /// Records every call instead of talking to Discovery Engine.
    #[derive(Default)]
    struct RecordingDocuments {
        imports: Mutex<Vec<ImportDocumentsRequest>>,
        lookups: Mutex<Vec<String>>,
        fail_with: Option<u16>,
    }

    #[async_trait]
    impl DocumentService for RecordingDocuments {
        async fn import_documents(
            &self,
            request: &ImportDocumentsRequest,
        ) -> shared::Result<Operation> {
            self.imports.lock().unwrap().push(request.clone());
            if let Some(status) = self.fail_with {
                return Err(Error::Remote {
                    service: "discoveryengine",
                    status,
                    message: "DataStore not found".to_string(),
                });
            }
            Ok(Operation {
                name: OPERATION.to_string(),
                metadata: Some(serde_json::json!({ "createTime": "2024-05-01T10:00:00Z" })),
                ..Default::default()
            })
        }

        async fn get_operation(&self, name: &str) -> shared::Result<Operation> {
            self.lookups.lock().unwrap().push(name.to_string());
            Ok(Operation {
                name: name.to_string(),
                done: true,
                ..Default::default()
            })
        }
    }

    fn config(pairs: &[(&str, &str)]) -> Result<LoaderConfig, ConfigError> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LoaderConfig::from_lookup(move |key| {
            pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
    }

    fn scenario_config() -> Result<LoaderConfig, ConfigError> {
        config(&[
            ("PROJECT_ID", "p1"),
            ("DATA_STORE_ID", "ds1"),
            ("GCS_URI", "gs://bucket/docs/*.json"),
        ])
    }

    fn app(
        config: Result<LoaderConfig, ConfigError>,
        documents: Arc<RecordingDocuments>,
    ) -> Router {
        router(Arc::new(AppState { config, documents }))
    }

    async fn send(app: Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_import_submits_one_incremental_request() {
        let documents = Arc::new(RecordingDocuments::default());
        let (status, body) = send(
            app(scenario_config(), documents.clone()),
            Method::POST,
            "/",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["operation_name"], OPERATION);

        let imports = documents.imports.lock().unwrap();
        assert_eq!(imports.len(), 1);
        let request = &imports[0];
        assert_eq!(
            request.parent,
            "projects/p1/locations/global/collections/default_collection/dataStores/ds1/branches/default_branch"
        );
        assert_eq!(request.gcs_source.input_uris, vec!["gs://bucket/docs/*.json"]);
        assert_eq!(request.gcs_source.data_schema, "content");
        assert_eq!(request.reconciliation_mode, ReconciliationMode::Incremental);
    }

    #[tokio::test]
    async fn test_any_method_triggers_import() {
        let documents = Arc::new(RecordingDocuments::default());
        let (status, _) = send(
            app(scenario_config(), documents.clone()),
            Method::GET,
            "/",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(documents.imports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_config_makes_no_remote_call() {
        let documents = Arc::new(RecordingDocuments::default());
        let config = config(&[("PROJECT_ID", "p1"), ("DATA_STORE_ID", "ds1")]);

        let (status, body) = send(app(config, documents.clone()), Method::POST, "/").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("GCS_URI"));
        assert!(documents.imports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submission_failure_is_reported() {
        let documents = Arc::new(RecordingDocuments {
            fail_with: Some(404),
            ..Default::default()
        });

        let (status, body) = send(
            app(scenario_config(), documents.clone()),
            Method::POST,
            "/",
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("DataStore not found"));
    }

    #[tokio::test]
    async fn test_operation_status() {
        let documents = Arc::new(RecordingDocuments::default());
        let uri = format!("/operations?name={}", OPERATION);

        let (status, body) = send(app(scenario_config(), documents.clone()), Method::GET, &uri).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["done"], true);
        assert_eq!(*documents.lookups.lock().unwrap(), vec![OPERATION.to_string()]);
    }

    #[tokio::test]
    async fn test_operation_status_rejects_foreign_names() {
        let documents = Arc::new(RecordingDocuments::default());
        let uri = "/operations?name=projects/123/locations/global/collections/default_collection/dataStores/other/operations/x";

        let (status, _) = send(app(scenario_config(), documents.clone()), Method::GET, uri).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(documents.lookups.lock().unwrap().is_empty());
    }
}
