use super::{BlueprintRelations, CatalogClient};
use crate::config::CatalogConfig;
use crate::entity::{Entity, EntityRef, EntityScope};
use crate::error::SyncError;
use crate::http::{ApiClient, RequestError};
use crate::mapping::MappingConfig;
use crate::status::ResyncStatus;
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct EntitiesResponse {
    #[serde(default)]
    entities: Vec<Entity>,
}

#[derive(Deserialize)]
struct EntityResponse {
    entity: Entity,
}

#[derive(Deserialize)]
struct BlueprintResponse {
    blueprint: BlueprintBody,
}

#[derive(Deserialize)]
struct BlueprintBody {
    #[serde(default)]
    relations: BTreeMap<String, RelationBody>,
}

#[derive(Deserialize)]
struct RelationBody {
    target: String,
}

#[derive(Deserialize)]
struct IntegrationResponse {
    integration: IntegrationBody,
}

#[derive(Deserialize)]
struct IntegrationBody {
    #[serde(default)]
    config: Option<MappingConfig>,
}

/// Catalog REST client.
///
/// Authenticates with client credentials (bearer token cached until shortly
/// before expiry) and sends every call through the shared `ApiClient`, so
/// catalog traffic is rate limited and time bounded.
pub struct HttpCatalogClient {
    api: ApiClient,
    base_url: String,
    credentials: Option<(String, String)>,
    token: Mutex<Option<CachedToken>>,
}

impl HttpCatalogClient {
    pub fn new(api: ApiClient, config: &CatalogConfig) -> Self {
        let credentials = match (&config.client_id, &config.client_secret) {
            (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
            _ => None,
        };
        Self {
            api,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            token: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn bearer(&self) -> Result<Option<String>, SyncError> {
        let Some((client_id, client_secret)) = &self.credentials else {
            return Ok(None);
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                return Ok(Some(token.value.clone()));
            }
        }

        let response: TokenResponse = self
            .api
            .send_json(self.api.http().post(self.url("/v1/auth/access_token")).json(&json!({
                "clientId": client_id,
                "clientSecret": client_secret,
            })))
            .await
            .map_err(|e| match e {
                RequestError::Status { status, body } if status == 401 || status == 403 => {
                    SyncError::Auth(format!("catalog rejected credentials: {}", body))
                }
                other => SyncError::from(other),
            })?;

        info!(expires_in = response.expires_in, "Obtained catalog access token");
        let value = response.access_token.clone();
        *cached = Some(CachedToken {
            value: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        });
        Ok(Some(value))
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, SyncError> {
        Ok(match self.bearer().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    /// Send an authorized request. A 401 drops the cached token so the next
    /// call authenticates again.
    async fn send(&self, request: RequestBuilder) -> Result<Response, RequestError> {
        let result = self.api.send(request).await;
        if let Err(RequestError::Status { status: 401, .. }) = &result {
            if self.token.lock().await.take().is_some() {
                warn!("Catalog rejected access token, dropping it");
            }
        }
        result
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, RequestError> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RequestError::Decode(e.to_string()))
    }

    /// Send and decode, treating 404 as `None`.
    async fn get_optional<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, SyncError> {
        let request = self.authorized(self.api.http().get(self.url(path))).await?;
        match self.send_json::<T>(request).await {
            Ok(body) => Ok(Some(body)),
            Err(RequestError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, request: RequestBuilder) -> Result<(), SyncError> {
        let request = self.authorized(request).await?;
        self.send(request)
            .await
            .map(|_| ())
            .map_err(|e| SyncError::from(e).into_apply())
    }
}

fn by_blueprint<'a, T, F>(items: &'a [T], blueprint: F) -> BTreeMap<&'a str, Vec<&'a T>>
where
    F: Fn(&'a T) -> &'a str,
{
    let mut groups: BTreeMap<&str, Vec<&T>> = BTreeMap::new();
    for item in items {
        groups.entry(blueprint(item)).or_default().push(item);
    }
    groups
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn search_entities(&self, scope: &EntityScope) -> Result<Vec<Entity>, SyncError> {
        let request = self
            .authorized(
                self.api
                    .http()
                    .post(self.url("/v1/entities/search"))
                    .json(&json!({"datasource": scope.datasource, "kind": scope.kind})),
            )
            .await?;
        let response: EntitiesResponse = self
            .send_json(request)
            .await
            .map_err(|e| SyncError::from(e).into_apply())?;
        debug!(scope = %scope, count = response.entities.len(), "Fetched prior entities");
        Ok(response.entities)
    }

    async fn get_entity(&self, entity: &EntityRef) -> Result<Option<Entity>, SyncError> {
        let path = format!(
            "/v1/blueprints/{}/entities/{}",
            urlencoding::encode(&entity.blueprint),
            urlencoding::encode(&entity.identifier)
        );
        Ok(self
            .get_optional::<EntityResponse>(&path)
            .await
            .map_err(SyncError::into_apply)?
            .map(|r| r.entity))
    }

    async fn existing_entities(
        &self,
        refs: &[EntityRef],
    ) -> Result<HashSet<EntityRef>, SyncError> {
        if refs.is_empty() {
            return Ok(HashSet::new());
        }
        let request = self
            .authorized(
                self.api
                    .http()
                    .post(self.url("/v1/entities/search"))
                    .json(&json!({ "refs": refs })),
            )
            .await?;
        let response: EntitiesResponse = self
            .send_json(request)
            .await
            .map_err(|e| SyncError::from(e).into_apply())?;
        Ok(response.entities.iter().map(Entity::entity_ref).collect())
    }

    async fn blueprint_relations(
        &self,
        blueprint: &str,
    ) -> Result<Option<BlueprintRelations>, SyncError> {
        let path = format!("/v1/blueprints/{}", urlencoding::encode(blueprint));
        Ok(self
            .get_optional::<BlueprintResponse>(&path)
            .await
            .map_err(SyncError::into_apply)?
            .map(|r| {
                r.blueprint
                    .relations
                    .into_iter()
                    .map(|(name, relation)| (name, relation.target))
                    .collect()
            }))
    }

    async fn upsert_entities(
        &self,
        scope: &EntityScope,
        entities: &[Entity],
    ) -> Result<(), SyncError> {
        for (blueprint, group) in by_blueprint(entities, |e| e.blueprint.as_str()) {
            let path = format!(
                "/v1/blueprints/{}/entities/bulk?upsert=true",
                urlencoding::encode(blueprint)
            );
            self.write(self.api.http().post(self.url(&path)).json(&json!({
                "datasource": scope.datasource,
                "kind": scope.kind,
                "entities": group,
            })))
            .await?;
        }
        Ok(())
    }

    async fn create_stub_entities(&self, refs: &[EntityRef]) -> Result<(), SyncError> {
        for (blueprint, group) in by_blueprint(refs, |r| r.blueprint.as_str()) {
            let path = format!(
                "/v1/blueprints/{}/entities/bulk?upsert=false",
                urlencoding::encode(blueprint)
            );
            let stubs: Vec<Entity> = group.into_iter().map(Entity::stub).collect();
            let request = self
                .authorized(self.api.http().post(self.url(&path)).json(&json!({ "entities": stubs })))
                .await?;
            match self.send(request).await {
                Ok(_) => {}
                // already exists
                Err(RequestError::Status { status: 409, .. }) => {
                    debug!(blueprint, "Stub targets already exist");
                }
                Err(e) => return Err(SyncError::from(e).into_apply()),
            }
        }
        Ok(())
    }

    async fn delete_entities(
        &self,
        scope: &EntityScope,
        refs: &[EntityRef],
    ) -> Result<(), SyncError> {
        for (blueprint, group) in by_blueprint(refs, |r| r.blueprint.as_str()) {
            let path = format!(
                "/v1/blueprints/{}/entities/bulk-delete",
                urlencoding::encode(blueprint)
            );
            let identifiers: Vec<&str> = group.iter().map(|r| r.identifier.as_str()).collect();
            self.write(self.api.http().post(self.url(&path)).json(&json!({
                "datasource": scope.datasource,
                "kind": scope.kind,
                "identifiers": identifiers,
            })))
            .await?;
        }
        Ok(())
    }

    async fn fetch_mapping_config(
        &self,
        integration: &str,
    ) -> Result<Option<MappingConfig>, SyncError> {
        let path = format!("/v1/integration/{}", urlencoding::encode(integration));
        Ok(self
            .get_optional::<IntegrationResponse>(&path)
            .await?
            .and_then(|r| r.integration.config))
    }

    async fn report_resync_state(
        &self,
        integration: &str,
        status: &ResyncStatus,
    ) -> Result<(), SyncError> {
        let path = format!(
            "/v1/integration/{}/resync-state",
            urlencoding::encode(integration)
        );
        let body: Value = serde_json::to_value(status)
            .map_err(|e| SyncError::Validation(format!("unserializable status: {}", e)))?;
        self.write(self.api.http().patch(self.url(&path)).json(&body))
            .await
    }
}
