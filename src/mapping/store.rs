use super::{CompiledMapping, MappingConfig};
use crate::catalog::CatalogClient;
use crate::error::SyncError;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Holds the active compiled mapping for one integration instance.
///
/// The mapping is refreshed at the start of every resync; it is only
/// recompiled when the specification actually changed.
pub struct MappingStore {
    integration: String,
    fallback: Option<MappingConfig>,
    current: RwLock<Option<(MappingConfig, Arc<CompiledMapping>)>>,
}

impl MappingStore {
    /// `fallback` is used when the catalog has no mapping for this instance
    /// (file configuration or the integration's built-in default).
    pub fn new(integration: impl Into<String>, fallback: Option<MappingConfig>) -> Self {
        Self {
            integration: integration.into(),
            fallback,
            current: RwLock::new(None),
        }
    }

    /// Load a mapping specification from a JSON file.
    pub fn load_file(path: &str) -> Result<MappingConfig, SyncError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Load(format!("failed to read mapping '{}': {}", path, e)))?;
        MappingConfig::from_json(&text)
    }

    /// Active mapping, if one has been loaded.
    pub fn current(&self) -> Option<Arc<CompiledMapping>> {
        self.current
            .read()
            .unwrap()
            .as_ref()
            .map(|(_, compiled)| Arc::clone(compiled))
    }

    /// Install `config`, compiling it unless it equals the active one.
    pub fn install(&self, config: MappingConfig) -> Result<Arc<CompiledMapping>, SyncError> {
        if let Some((active, compiled)) = self.current.read().unwrap().as_ref() {
            if *active == config {
                return Ok(Arc::clone(compiled));
            }
        }

        let compiled = Arc::new(CompiledMapping::compile(&config)?);
        info!(
            integration = %self.integration,
            resources = compiled.resources.len(),
            "Mapping compiled"
        );
        *self.current.write().unwrap() = Some((config, Arc::clone(&compiled)));
        Ok(compiled)
    }

    /// Fetch the mapping from the catalog and install it.
    ///
    /// Falls back to the active mapping when the catalog is unreachable and
    /// to the configured fallback when the catalog has none.
    pub async fn refresh(
        &self,
        catalog: &dyn CatalogClient,
    ) -> Result<Arc<CompiledMapping>, SyncError> {
        match catalog.fetch_mapping_config(&self.integration).await {
            Ok(Some(config)) => self.install(config),
            Ok(None) => match &self.fallback {
                Some(fallback) => self.install(fallback.clone()),
                None => Err(SyncError::Load(format!(
                    "no mapping configured for integration '{}'",
                    self.integration
                ))),
            },
            Err(e) => {
                if let Some(current) = self.current() {
                    warn!(
                        integration = %self.integration,
                        error = %e,
                        "Failed to fetch mapping, keeping active mapping"
                    );
                    return Ok(current);
                }
                match &self.fallback {
                    Some(fallback) => {
                        warn!(
                            integration = %self.integration,
                            error = %e,
                            "Failed to fetch mapping, using fallback"
                        );
                        self.install(fallback.clone())
                    }
                    None => Err(e),
                }
            }
        }
    }
}
