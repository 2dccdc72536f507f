use super::api::GitHubClient;
use catalog_sync::error::SyncError;
use catalog_sync::mapping::CompiledResource;
use catalog_sync::resync::RawDataProducer;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, warn};

pub const KIND_REPOSITORY: &str = "repository";
pub const KIND_ISSUE: &str = "issue";
pub const KIND_PULL_REQUEST: &str = "pull-request";

/// Field added to issue and pull request records naming their repository.
pub const REPOSITORY_FIELD: &str = "__repository";

/// Full-resync record source for GitHub.
///
/// Each API page becomes one batch. Issues and pull requests are listed per
/// repository, so those kinds first page through the repositories.
/// Selector options: `state` (open, closed, all; default open).
pub struct GitHubProducer {
    client: GitHubClient,
    organization: Option<String>,
}

impl GitHubProducer {
    pub fn new(client: GitHubClient, organization: Option<String>) -> Self {
        Self {
            client,
            organization,
        }
    }

    /// Page through `urls` in order, following `Link` headers. Ends after
    /// the first error.
    fn pages<'a>(&'a self, urls: Vec<String>) -> BoxStream<'a, Result<Vec<Value>, SyncError>> {
        stream::unfold(
            (VecDeque::from(urls), false),
            move |(mut pending, failed)| async move {
                if failed {
                    return None;
                }
                let url = pending.pop_front()?;
                match self.client.page(&url).await {
                    Ok(page) => {
                        if let Some(next) = page.next {
                            pending.push_front(next);
                        }
                        Some((Ok(page.items), (pending, false)))
                    }
                    Err(e) => Some((Err(e), (pending, true))),
                }
            },
        )
        .boxed()
    }

    async fn repository_names(&self) -> Result<Vec<String>, SyncError> {
        let first = self.client.repositories_url(self.organization.as_deref());
        let mut names = Vec::new();
        let mut pages = self.pages(vec![first]);
        while let Some(page) = pages.next().await {
            names.extend(
                page?
                    .iter()
                    .filter_map(|repo| repo.get("full_name").and_then(Value::as_str))
                    .map(str::to_string),
            );
        }
        debug!(count = names.len(), "Listed repositories");
        Ok(names)
    }

    /// Records of a per-repository kind, tagged with their repository.
    fn per_repository<'a>(
        &'a self,
        kind: &'a str,
        state: String,
    ) -> BoxStream<'a, Result<Vec<Value>, SyncError>> {
        stream::once(self.repository_names())
            .map(move |names| match names {
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
                Ok(names) => {
                    let urls = names
                        .iter()
                        .map(|name| match kind {
                            KIND_ISSUE => self.client.issues_url(name, &state),
                            _ => self.client.pulls_url(name, &state),
                        })
                        .collect();
                    self.pages(urls)
                        .map(move |batch| batch.map(|records| prepare(kind, records)))
                        .boxed()
                }
            })
            .flatten()
            .boxed()
    }
}

impl RawDataProducer for GitHubProducer {
    fn batches<'a>(
        &'a self,
        resource: &'a CompiledResource,
    ) -> BoxStream<'a, Result<Vec<Value>, SyncError>> {
        let state = resource
            .options
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or("open")
            .to_string();

        match resource.kind.as_str() {
            KIND_REPOSITORY => {
                let first = self.client.repositories_url(self.organization.as_deref());
                self.pages(vec![first])
            }
            KIND_ISSUE => self.per_repository(KIND_ISSUE, state),
            KIND_PULL_REQUEST => self.per_repository(KIND_PULL_REQUEST, state),
            other => {
                warn!(kind = %other, "Kind not supported by the GitHub integration");
                stream::once(future::ready(Err(SyncError::Fetch {
                    kind: other.to_string(),
                    message: "kind not supported by the GitHub integration".to_string(),
                    transient: false,
                })))
                .boxed()
            }
        }
    }
}

/// Tag records with their repository. The issues endpoint also lists pull
/// requests; those are dropped from the issue kind.
pub fn prepare(kind: &str, records: Vec<Value>) -> Vec<Value> {
    records
        .into_iter()
        .filter(|record| kind != KIND_ISSUE || record.get("pull_request").is_none())
        .map(tag_repository)
        .collect()
}

/// Add [`REPOSITORY_FIELD`] from `repository_url`
/// (`https://api.github.com/repos/{owner}/{name}`).
pub fn tag_repository(mut record: Value) -> Value {
    let full_name = record
        .get("repository_url")
        .and_then(Value::as_str)
        .and_then(|url| url.split("/repos/").nth(1))
        .map(str::to_string)
        .or_else(|| {
            record
                .pointer("/base/repo/full_name")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
    if let (Some(full_name), Some(object)) = (full_name, record.as_object_mut()) {
        object.insert(REPOSITORY_FIELD.to_string(), Value::String(full_name));
    }
    record
}
