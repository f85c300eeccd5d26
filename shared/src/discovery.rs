//! Discovery Engine (Vertex AI Search) document import client.
//!
//! Only the two calls the loader needs are covered: `documents:import`, which
//! starts a long-running import into a data-store branch, and
//! `operations.get`, which reports on it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::auth::TokenProvider;
use crate::http::ensure_success;
use crate::retry::{with_retry, RetryPolicy};
use crate::Result;

pub const DEFAULT_COLLECTION: &str = "default_collection";
pub const DEFAULT_BRANCH: &str = "default_branch";
/// Schema tag for unstructured documents with content.
pub const DATA_SCHEMA_CONTENT: &str = "content";

const SERVICE: &str = "discoveryengine";

/// Resource path of a data store in the default collection.
pub fn data_store_path(project: &str, location: &str, data_store: &str) -> String {
    format!(
        "projects/{}/locations/{}/collections/{}/dataStores/{}",
        project, location, DEFAULT_COLLECTION, data_store
    )
}

/// Resource path of a branch within a data store.
pub fn branch_path(project: &str, location: &str, data_store: &str, branch: &str) -> String {
    format!(
        "{}/branches/{}",
        data_store_path(project, location, data_store),
        branch
    )
}

/// API host for a location; `global` uses the unprefixed host.
pub fn endpoint_for(location: &str) -> String {
    if location == "global" {
        "https://discoveryengine.googleapis.com".to_string()
    } else {
        format!("https://{}-discoveryengine.googleapis.com", location)
    }
}

/// `documents:import` URL for a branch.
pub fn import_url(endpoint: &str, parent: &str) -> String {
    format!("{}/v1/{}/documents:import", endpoint, parent)
}

/// `operations.get` URL for a full operation name.
pub fn operation_url(endpoint: &str, name: &str) -> String {
    format!("{}/v1/{}", endpoint, name)
}

/// How imported documents merge with the ones already in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationMode {
    /// Upsert: new documents are added, existing ones updated
    Incremental,
    /// Replace the branch contents entirely
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsSource {
    pub input_uris: Vec<String>,
    pub data_schema: String,
}

/// Body of `POST v1/{parent}/documents:import`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDocumentsRequest {
    /// Branch the documents land in; part of the URL, not the body
    #[serde(skip)]
    pub parent: String,
    pub gcs_source: GcsSource,
    pub reconciliation_mode: ReconciliationMode,
}

impl ImportDocumentsRequest {
    /// Incremental import of `content`-schema documents.
    pub fn incremental_content(parent: String, input_uris: Vec<String>) -> Self {
        Self {
            parent,
            gcs_source: GcsSource {
                input_uris,
                data_schema: DATA_SCHEMA_CONTENT.to_string(),
            },
            reconciliation_mode: ReconciliationMode::Incremental,
        }
    }
}

/// Long-running operation handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

/// Progress counters attached to an import operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDocumentsMetadata {
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub update_time: Option<String>,
    #[serde(default, deserialize_with = "int64_field")]
    pub success_count: Option<i64>,
    #[serde(default, deserialize_with = "int64_field")]
    pub failure_count: Option<i64>,
    #[serde(default, deserialize_with = "int64_field")]
    pub total_count: Option<i64>,
}

impl Operation {
    /// Decode the import progress counters, if the operation carries any.
    pub fn import_metadata(&self) -> Option<ImportDocumentsMetadata> {
        self.metadata
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// int64 values arrive as JSON strings; accept plain numbers too.
fn int64_field<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(i64),
        Text(String),
    }

    match Option::<Int64>::deserialize(deserializer)? {
        Some(Int64::Number(n)) => Ok(Some(n)),
        Some(Int64::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// The document-ingestion API as seen by the loader.
#[async_trait]
pub trait DocumentService: Send + Sync {
    /// Submit an import; returns as soon as the operation is created.
    async fn import_documents(&self, request: &ImportDocumentsRequest) -> Result<Operation>;

    /// Fetch the current state of an operation.
    async fn get_operation(&self, name: &str) -> Result<Operation>;
}

/// REST client for the Discovery Engine v1 API.
pub struct DocumentServiceClient {
    http_client: reqwest::Client,
    tokens: Arc<TokenProvider>,
    endpoint: String,
    retry: RetryPolicy,
}

impl DocumentServiceClient {
    pub fn new(
        http_client: reqwest::Client,
        tokens: Arc<TokenProvider>,
        location: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http_client,
            tokens,
            endpoint: endpoint_for(location),
            retry,
        }
    }

    async fn post_import(&self, request: &ImportDocumentsRequest) -> Result<Operation> {
        let url = import_url(&self.endpoint, &request.parent);
        let token = self.tokens.access_token().await?;

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;

        Ok(ensure_success(SERVICE, response).await?.json().await?)
    }

    async fn fetch_operation(&self, name: &str) -> Result<Operation> {
        let url = operation_url(&self.endpoint, name);
        let token = self.tokens.access_token().await?;

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?;

        Ok(ensure_success(SERVICE, response).await?.json().await?)
    }
}

#[async_trait]
impl DocumentService for DocumentServiceClient {
    async fn import_documents(&self, request: &ImportDocumentsRequest) -> Result<Operation> {
        debug!(parent = %request.parent, "Submitting documents:import");
        with_retry(&self.retry, "documents:import", move || self.post_import(request)).await
    }

    async fn get_operation(&self, name: &str) -> Result<Operation> {
        with_retry(&self.retry, "operations.get", move || self.fetch_operation(name)).await
    }
}
