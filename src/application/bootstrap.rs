use crate::infrastructure::config::{ensure_default_configs, load_sync_config, SyncConfig};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub database_path: PathBuf,
    pub config: SyncConfig,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join("compass-sync.sqlite");

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    let config = load_sync_config(&config_dir)?;
    init_logging(&config.log_level);
    initialize_database(&database_path)?;

    tracing::info!(
        workspace_root = %workspace_root.display(),
        database_path = %database_path.display(),
        "workspace bootstrapped"
    );

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        database_path,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::sync_token_store::{SqliteSyncTokenStore, SyncTokenStore};
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_WORKSPACE_ID: AtomicU64 = AtomicU64::new(0);

    fn temp_workspace() -> PathBuf {
        let sequence = NEXT_WORKSPACE_ID.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "compass-sync-bootstrap-{}-{sequence}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        root
    }

    #[test]
    fn bootstrap_creates_layout_and_schema() {
        let root = temp_workspace();
        let result = bootstrap_workspace(&root).expect("bootstrap");

        assert!(root.join("config/sync.json").exists());
        assert!(root.join("logs").is_dir());
        assert!(result.database_path.exists());
        assert_eq!(result.config, SyncConfig::default());

        let store = SqliteSyncTokenStore::new(&result.database_path);
        assert_eq!(store.get_cursor("user-1", "primary").expect("cursor"), None);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn bootstrap_is_idempotent_and_keeps_edited_config() {
        let root = temp_workspace();
        bootstrap_workspace(&root).expect("first bootstrap");

        let config_path = root.join("config/sync.json");
        let edited = fs::read_to_string(&config_path)
            .expect("read config")
            .replace("\"requestTimeoutMs\": 10000", "\"requestTimeoutMs\": 2500");
        fs::write(&config_path, edited).expect("write config");

        let result = bootstrap_workspace(&root).expect("second bootstrap");
        assert_eq!(result.config.request_timeout_ms, 2500);

        let _ = fs::remove_dir_all(root);
    }
}
