//! Shared library for the grounded-chat services.
//!
//! This crate provides configuration, error types, Google API clients and the
//! chat session store used by both the loader and the web app.

pub mod auth;
pub mod chat;
pub mod config;
pub mod discovery;
pub mod error;
pub mod http;
pub mod models;
pub mod retry;
pub mod vertex;

pub use auth::{CredentialSource, TokenProvider};
pub use chat::{SessionHandle, SessionStore};
pub use config::{ConfigError, LoaderConfig, ServerConfig, WebConfig};
pub use discovery::{DocumentService, DocumentServiceClient, ImportDocumentsRequest, Operation};
pub use error::{Error, Result};
pub use http::ApiResponse;
pub use models::{ChatRequest, ChatResponse, HistoryResponse, ImportAck, Role, Turn};
pub use vertex::{GenerativeModel, ModelFactory, ModelSettings, VertexModelFactory};
