//! HTTP catalog client.
//!
//! Endpoints:
//! - `POST   /v1/blueprints/{blueprint}/entities?upsert=true&create_missing_related_entities=..`
//!   (`201` created, `200` updated)
//! - `DELETE /v1/blueprints/{blueprint}/entities/{identifier}` (`404` means already gone)
//! - `GET    /v1/integrations/{integration}/entities?cursor=..`, paged through `next`
//! - `GET    /v1/blueprints/{blueprint}/entities/{identifier}/dependents`

use super::{default_timeout_secs, endpoint};
use crate::catalog::{CatalogClient, CatalogEntityRef, UpsertContext, UpsertResult};
use crate::error::{CatalogError, CatalogResult};
use async_trait::async_trait;
use ocean_types::{Entity, EntityKey, IntegrationId};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Connection settings of the catalog service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCatalogConfig {
    pub base_url: String,
    /// Bearer token. Usually supplied through the environment.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HttpCatalogConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntityList<T> {
    entities: Vec<T>,
    /// Cursor of the following page; absent or null on the last one.
    #[serde(default)]
    next: Option<String>,
}

/// [`CatalogClient`] over the catalog's REST API.
pub struct HttpCatalogClient {
    config: HttpCatalogConfig,
    client: Client,
}

impl HttpCatalogClient {
    pub fn new(config: HttpCatalogConfig) -> CatalogResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CatalogError::Unavailable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> CatalogResult<reqwest::Url> {
        endpoint(&self.config.base_url, segments).map_err(CatalogError::Unavailable)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> CatalogResult<reqwest::Response> {
        let request = match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        request
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(format!("catalog request failed: {e}")))
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn upsert_entity(&self, entity: &Entity, ctx: &UpsertContext) -> CatalogResult<UpsertResult> {
        let url = self.url(["v1", "blueprints", entity.blueprint.as_str(), "entities"])?;
        let create_missing = ctx.create_missing_related.to_string();
        let request = self.client.post(url).json(entity).query(&[
            ("upsert", "true"),
            ("create_missing_related_entities", create_missing.as_str()),
            ("integration", ctx.integration.as_str()),
            ("kind", ctx.kind.as_str()),
        ]);

        debug!(entity = %entity.key(), "upserting entity");
        let response = check(self.send(request).await?).await?;
        Ok(match response.status() {
            StatusCode::CREATED => UpsertResult::Created,
            _ => UpsertResult::Updated,
        })
    }

    async fn delete_entity(&self, key: &EntityKey) -> CatalogResult<bool> {
        let url = self.url([
            "v1",
            "blueprints",
            key.blueprint.as_str(),
            "entities",
            key.identifier.as_str(),
        ])?;

        debug!(entity = %key, "deleting entity");
        let response = self.send(self.client.delete(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }

    async fn list_entities(&self, integration: &IntegrationId) -> CatalogResult<Vec<CatalogEntityRef>> {
        let url = self.url(["v1", "integrations", integration.as_str(), "entities"])?;
        let mut entities = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut request = self.client.get(url.clone());
            if let Some(cursor) = &cursor {
                request = request.query(&[("cursor", cursor.as_str())]);
            }
            debug!(%integration, cursor = ?cursor, "listing catalog entities");
            let response = check(self.send(request).await?).await?;
            let page: EntityList<CatalogEntityRef> = response
                .json()
                .await
                .map_err(|e| CatalogError::Decode(e.to_string()))?;
            entities.extend(page.entities);

            match page.next.filter(|next| !next.is_empty()) {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(CatalogError::Decode(format!(
                        "entity listing repeated cursor {next}"
                    )));
                }
                Some(next) => cursor = Some(next),
                None => return Ok(entities),
            }
        }
    }

    async fn list_dependents(&self, key: &EntityKey) -> CatalogResult<Vec<EntityKey>> {
        let url = self.url([
            "v1",
            "blueprints",
            key.blueprint.as_str(),
            "entities",
            key.identifier.as_str(),
            "dependents",
        ])?;
        let response = check(self.send(self.client.get(url)).await?).await?;
        let list: EntityList<EntityKey> = response
            .json()
            .await
            .map_err(|e| CatalogError::Decode(e.to_string()))?;
        Ok(list.entities)
    }
}

/// 408, 429 and 5xx are transient; any other non-success status is a
/// rejection.
async fn check(response: reqwest::Response) -> CatalogResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(CatalogError::Unavailable(format!("catalog answered {status}: {body}")))
    } else {
        Err(CatalogError::Rejected {
            status: status.as_u16(),
            message: body,
        })
    }
}
