//! Per-browser-session chat state.
//!
//! A [`SessionStore`] maps session ids to [`ChatSession`]s. Each session owns
//! one model handle, created on first access, and the transcript that is both
//! displayed and replayed to the model. Session locks are never held while a
//! model call is in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::{Role, Turn};
use crate::vertex::{Content, GenerativeModel, ModelFactory};
use crate::{Error, Result};

/// Shown in place of a reply when the model could not be reached.
pub const FALLBACK_REPLY: &str =
    "Sorry, I couldn't get an answer right now. Please try again in a moment.";
/// Shown when the model answered without any usable text.
pub const EMPTY_REPLY: &str =
    "Sorry, I couldn't find an answer to that. Try rephrasing your question.";

pub type SessionHandle = Arc<Mutex<ChatSession>>;

/// One browser session's conversation.
pub struct ChatSession {
    pub id: String,
    model: Arc<dyn GenerativeModel>,
    turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    cancel: CancellationToken,
    /// Model calls currently awaiting a reply
    in_flight: Arc<AtomicUsize>,
}

/// Counts a pending model call for as long as it is alive, including when
/// the request future is dropped part way through.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ChatSession {
    fn new(id: String, model: Arc<dyn GenerativeModel>) -> Self {
        let now = Utc::now();
        Self {
            id,
            model,
            turns: Vec::new(),
            created_at: now,
            last_active: now,
            cancel: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    fn push(&mut self, turn: Turn) {
        self.last_active = Utc::now();
        self.turns.push(turn);
    }

    /// Transcript as model input. Exchanges whose reply failed are left out
    /// so the model never sees fallback text as its own words.
    pub fn model_contents(&self) -> Vec<Content> {
        let mut contents: Vec<Content> = Vec::with_capacity(self.turns.len());
        for turn in &self.turns {
            if turn.failed {
                if contents.last().is_some_and(|c| c.role == Role::User.api_role()) {
                    contents.pop();
                }
                continue;
            }
            contents.push(Content::text(turn.role.api_role(), turn.content.clone()));
        }
        contents
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Idle means no call pending and nothing submitted for `ttl`.
    pub fn is_idle(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if self.is_busy() {
            return false;
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52));
        now - self.last_active > ttl
    }
}

/// All live chat sessions of this process.
pub struct SessionStore {
    factory: Arc<dyn ModelFactory>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    pub fn new(factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            factory,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Return the session for `session_id`, creating it and its model on
    /// first access.
    pub async fn get_or_create(&self, session_id: &str) -> Result<SessionHandle> {
        if let Some(session) = self.sessions.read().await.get(session_id) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(session_id) {
            return Ok(Arc::clone(session));
        }

        let model = self.factory.create()?;
        let session = Arc::new(Mutex::new(ChatSession::new(session_id.to_string(), model)));
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        info!(session_id, "Chat session started");

        Ok(session)
    }

    /// Snapshot of a session's transcript.
    pub async fn history(session: &SessionHandle) -> Vec<Turn> {
        session.lock().await.turns().to_vec()
    }

    /// Send `text` to the model and record both sides of the exchange.
    ///
    /// Blank input is ignored and returns `None`. Otherwise the returned turn
    /// is the reply, or a fallback turn if the model call failed.
    pub async fn submit_message(&self, session: &SessionHandle, text: &str) -> Option<Turn> {
        let text = text.trim();
        if text.is_empty() {
            debug!("Ignoring blank message");
            return None;
        }

        let (session_id, model, contents, cancel, _in_flight) = {
            let mut session = session.lock().await;
            session.push(Turn::user(text));
            (
                session.id.clone(),
                Arc::clone(&session.model),
                session.model_contents(),
                session.cancel.clone(),
                InFlightGuard::new(&session.in_flight),
            )
        };

        debug!(session_id = %session_id, turns = contents.len(), "Sending request");
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = model.generate_content(contents) => result.and_then(|r| r.first_text()),
        };

        let reply = match outcome {
            Ok(text) => {
                debug!(session_id = %session_id, "Got response");
                Turn::assistant(text)
            }
            Err(e @ Error::MalformedResponse(_)) => {
                warn!(session_id = %session_id, error = %e, "Model returned no usable answer");
                Turn::fallback(EMPTY_REPLY)
            }
            Err(Error::Cancelled) => {
                info!(session_id = %session_id, "Session ended mid-call; reply discarded");
                Turn::fallback(FALLBACK_REPLY)
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Model call failed");
                Turn::fallback(FALLBACK_REPLY)
            }
        };

        session.lock().await.push(reply.clone());
        Some(reply)
    }

    /// End a session; any call in flight for it is cancelled.
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            Some(session) => {
                session.lock().await.cancel.cancel();
                info!(session_id, "Chat session ended");
                true
            }
            None => false,
        }
    }

    /// Drop sessions idle for longer than `ttl`. Sessions with a model call
    /// pending, or locked right now, are kept.
    pub async fn expire_idle(&self, ttl: Duration) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();

        sessions.retain(|session_id, session| match session.try_lock() {
            Ok(state) if state.is_idle(now, ttl) => {
                state.cancel.cancel();
                debug!(
                    session_id = %session_id,
                    age_secs = (now - state.created_at).num_seconds(),
                    turns = state.turns.len(),
                    "Expiring idle session"
                );
                false
            }
            _ => true,
        });

        let expired = before - sessions.len();
        if expired > 0 {
            info!(expired, remaining = sessions.len(), "Expired idle chat sessions");
        }
        expired
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Periodically expire idle sessions in the background.
    pub fn spawn_sweeper(self: Arc<Self>, ttl: Duration, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                self.expire_idle(ttl).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::{Candidate, GenerateContentResponse, Part};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every call with a fixed reply, or fails, and records inputs.
    pub struct FakeModel {
        pub reply: Option<String>,
        pub calls: Mutex<Vec<Vec<Content>>>,
    }

    #[async_trait]
    impl GenerativeModel for FakeModel {
        async fn generate_content(&self, contents: Vec<Content>) -> Result<GenerateContentResponse> {
            self.calls.lock().await.push(contents);
            match &self.reply {
                Some(text) => Ok(GenerateContentResponse {
                    candidates: vec![Candidate {
                        content: Some(Content::text("model", text.clone())),
                        ..Default::default()
                    }],
                    prompt_feedback: None,
                }),
                None => Err(Error::Remote {
                    service: "aiplatform",
                    status: 503,
                    message: "network unreachable".to_string(),
                }),
            }
        }
    }

    pub struct FakeFactory {
        pub model: Arc<FakeModel>,
        pub created: AtomicUsize,
    }

    impl FakeFactory {
        pub fn replying(reply: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                model: Arc::new(FakeModel {
                    reply: reply.map(String::from),
                    calls: Mutex::new(Vec::new()),
                }),
                created: AtomicUsize::new(0),
            })
        }

        pub async fn call_count(&self) -> usize {
            self.model.calls.lock().await.len()
        }
    }

    impl ModelFactory for FakeFactory {
        fn create(&self) -> Result<Arc<dyn GenerativeModel>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(self.model.clone() as Arc<dyn GenerativeModel>)
        }
    }

    fn roles(turns: &[Turn]) -> Vec<(Role, &str, bool)> {
        turns
            .iter()
            .map(|t| (t.role, t.content.as_str(), t.failed))
            .collect()
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_session() {
        let factory = FakeFactory::replying(Some("hi"));
        let store = SessionStore::new(factory.clone());

        let first = store.get_or_create("s1").await.unwrap();
        assert!(SessionStore::history(&first).await.is_empty());
        let again = store.get_or_create("s1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        store.get_or_create("s2").await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(store.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_blank_message_is_ignored() {
        let factory = FakeFactory::replying(Some("hi"));
        let store = SessionStore::new(factory.clone());
        let session = store.get_or_create("s1").await.unwrap();

        assert!(store.submit_message(&session, "").await.is_none());
        assert!(store.submit_message(&session, "   ").await.is_none());

        assert_eq!(factory.call_count().await, 0);
        assert!(SessionStore::history(&session).await.is_empty());
    }

    #[tokio::test]
    async fn test_exchange_appends_user_then_assistant() {
        let factory = FakeFactory::replying(Some("Use a pinch of salt."));
        let store = SessionStore::new(factory.clone());
        let session = store.get_or_create("s1").await.unwrap();

        let reply = store
            .submit_message(&session, "How do I season pasta water?")
            .await
            .unwrap();
        assert_eq!(reply.content, "Use a pinch of salt.");

        let history = SessionStore::history(&session).await;
        assert_eq!(
            roles(&history),
            vec![
                (Role::User, "How do I season pasta water?", false),
                (Role::Assistant, "Use a pinch of salt.", false),
            ]
        );
        assert_eq!(factory.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_model_sees_whole_conversation() {
        let factory = FakeFactory::replying(Some("ok"));
        let store = SessionStore::new(factory.clone());
        let session = store.get_or_create("s1").await.unwrap();

        store.submit_message(&session, "first").await;
        store.submit_message(&session, "second").await;

        let calls = factory.model.calls.lock().await;
        let last = calls.last().unwrap();
        let sent: Vec<(&str, Option<&str>)> = last
            .iter()
            .map(|c| (c.role.as_str(), c.parts[0].text.as_deref()))
            .collect();
        assert_eq!(
            sent,
            vec![
                ("user", Some("first")),
                ("model", Some("ok")),
                ("user", Some("second")),
            ]
        );
    }

    #[tokio::test]
    async fn test_model_failure_becomes_fallback_turn() {
        let factory = FakeFactory::replying(None);
        let store = SessionStore::new(factory.clone());
        let session = store.get_or_create("s1").await.unwrap();

        let reply = store.submit_message(&session, "Hello?").await.unwrap();
        assert!(reply.failed);
        assert_eq!(reply.content, FALLBACK_REPLY);

        let history = SessionStore::history(&session).await;
        assert_eq!(
            roles(&history),
            vec![
                (Role::User, "Hello?", false),
                (Role::Assistant, FALLBACK_REPLY, true),
            ]
        );

        // The failed exchange is not replayed to the model.
        assert!(session.lock().await.model_contents().is_empty());
    }

    #[tokio::test]
    async fn test_empty_candidates_become_fallback_turn() {
        struct Silent;

        #[async_trait]
        impl GenerativeModel for Silent {
            async fn generate_content(&self, _: Vec<Content>) -> Result<GenerateContentResponse> {
                Ok(GenerateContentResponse {
                    candidates: vec![Candidate {
                        content: Some(Content {
                            role: "model".to_string(),
                            parts: vec![Part { text: None }],
                        }),
                        ..Default::default()
                    }],
                    prompt_feedback: None,
                })
            }
        }

        struct SilentFactory;
        impl ModelFactory for SilentFactory {
            fn create(&self) -> Result<Arc<dyn GenerativeModel>> {
                Ok(Arc::new(Silent))
            }
        }

        let store = SessionStore::new(Arc::new(SilentFactory));
        let session = store.get_or_create("s1").await.unwrap();

        let reply = store.submit_message(&session, "anything").await.unwrap();
        assert!(reply.failed);
        assert_eq!(reply.content, EMPTY_REPLY);
        assert_eq!(SessionStore::history(&session).await.len(), 2);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let factory = FakeFactory::replying(Some("ok"));
        let store = SessionStore::new(factory.clone());
        let a = store.get_or_create("a").await.unwrap();
        let b = store.get_or_create("b").await.unwrap();

        store.submit_message(&a, "only in a").await;

        assert_eq!(SessionStore::history(&a).await.len(), 2);
        assert!(SessionStore::history(&b).await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_expire() {
        let factory = FakeFactory::replying(Some("ok"));
        let store = SessionStore::new(factory.clone());

        let old = store.get_or_create("old").await.unwrap();
        store.get_or_create("fresh").await.unwrap();
        old.lock().await.last_active = Utc::now() - chrono::Duration::hours(2);

        assert_eq!(store.expire_idle(Duration::from_secs(3600)).await, 1);
        assert_eq!(store.session_count().await, 1);
        assert!(old.lock().await.cancel.is_cancelled());

        assert!(store.remove("fresh").await);
        assert!(!store.remove("fresh").await);
        assert_eq!(store.session_count().await, 0);

        // A returning browser gets a brand new session.
        store.get_or_create("old").await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
    }

    /// Never answers.
    struct Hanging;

    #[async_trait]
    impl GenerativeModel for Hanging {
        async fn generate_content(&self, _: Vec<Content>) -> Result<GenerateContentResponse> {
            std::future::pending().await
        }
    }

    struct HangingFactory;

    impl ModelFactory for HangingFactory {
        fn create(&self) -> Result<Arc<dyn GenerativeModel>> {
            Ok(Arc::new(Hanging))
        }
    }

    /// Start a message on a hanging model and wait until its user turn is in.
    async fn start_hanging_call(
        store: &Arc<SessionStore>,
        session: &SessionHandle,
    ) -> JoinHandle<Option<Turn>> {
        let pending = {
            let store = Arc::clone(store);
            let session = Arc::clone(session);
            tokio::spawn(async move { store.submit_message(&session, "hello").await })
        };

        while SessionStore::history(session).await.is_empty() {
            tokio::task::yield_now().await;
        }
        pending
    }

    #[tokio::test]
    async fn test_cancelled_session_discards_reply() {
        let store = Arc::new(SessionStore::new(Arc::new(HangingFactory)));
        let session = store.get_or_create("s1").await.unwrap();

        let pending = start_hanging_call(&store, &session).await;
        store.remove("s1").await;

        let reply = pending.await.unwrap().unwrap();
        assert!(reply.failed);
    }

    #[tokio::test]
    async fn test_sweeper_keeps_session_with_call_pending() {
        let store = Arc::new(SessionStore::new(Arc::new(HangingFactory)));
        let session = store.get_or_create("s1").await.unwrap();

        let pending = start_hanging_call(&store, &session).await;
        session.lock().await.last_active = Utc::now() - chrono::Duration::seconds(120);

        assert_eq!(store.expire_idle(Duration::from_secs(60)).await, 0);
        assert_eq!(store.session_count().await, 1);
        assert!(!session.lock().await.cancel.is_cancelled());
        assert!(!pending.is_finished());

        // Once the request goes away the session is idle again.
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(!session.lock().await.is_busy());
        assert_eq!(store.expire_idle(Duration::from_secs(60)).await, 1);
    }
}
