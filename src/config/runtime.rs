use super::SyncConfig;

/// Overlay `SYNC_*` environment variables on top of a loaded config.
///
/// Unparseable values are ignored and the file/default value is kept.
pub fn apply_env_overrides(cfg: &mut SyncConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut SyncConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SYNC_INTEGRATION_IDENTIFIER") {
        cfg.integration.identifier = v;
    }
    if let Some(v) = lookup("SYNC_INTEGRATION_TYPE") {
        cfg.integration.integration_type = v;
    }
    if let Some(v) = lookup("SYNC_DATASOURCE") {
        cfg.integration.datasource = Some(v);
    }
    if let Some(v) = lookup("SYNC_MAPPING_PATH") {
        cfg.integration.mapping_path = Some(v);
    }
    if let Some(n) = lookup("SYNC_RESYNC_INTERVAL_MINUTES").and_then(|v| v.parse().ok()) {
        cfg.integration.resync_interval_minutes = n;
    }
    if let Some(v) = lookup("SYNC_CATALOG_BASE_URL") {
        cfg.catalog.base_url = v;
    }
    if let Some(v) = lookup("SYNC_CATALOG_CLIENT_ID") {
        cfg.catalog.client_id = Some(v);
    }
    if let Some(v) = lookup("SYNC_CATALOG_CLIENT_SECRET") {
        cfg.catalog.client_secret = Some(v);
    }
    if let Some(n) = lookup("SYNC_EVENT_WORKERS").and_then(|v| v.parse().ok()) {
        cfg.events.workers = n;
    }
    if let Some(n) = lookup("SYNC_EVENT_MAX_RETRIES").and_then(|v| v.parse().ok()) {
        cfg.events.max_retries = n;
    }
    if let Some(n) = lookup("SYNC_MAX_CONCURRENT_REQUESTS").and_then(|v| v.parse().ok()) {
        cfg.rate_limit.max_concurrent = n;
    }
    if let Some(n) = lookup("SYNC_API_PORT").and_then(|v| v.parse().ok()) {
        cfg.api.port = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_overrides_replace_values() {
        let env: HashMap<&str, &str> = [
            ("SYNC_INTEGRATION_IDENTIFIER", "from-env"),
            ("SYNC_CATALOG_CLIENT_ID", "cid"),
            ("SYNC_EVENT_WORKERS", "12"),
            ("SYNC_API_PORT", "7000"),
        ]
        .into_iter()
        .collect();

        let mut cfg = SyncConfig::default();
        apply_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.integration.identifier, "from-env");
        assert_eq!(cfg.catalog.client_id.as_deref(), Some("cid"));
        assert_eq!(cfg.events.workers, 12);
        assert_eq!(cfg.api.port, 7000);
    }

    #[test]
    fn test_unparseable_values_ignored() {
        let mut cfg = SyncConfig::default();
        apply_overrides(&mut cfg, |k| {
            (k == "SYNC_EVENT_WORKERS").then(|| "lots".to_string())
        });
        assert_eq!(cfg.events.workers, 5);
    }
}
