use crate::infrastructure::config::{ensure_default_configs, load_queue_config, QueueConfig};
use crate::infrastructure::durable_store::SqliteDurableStore;
use crate::infrastructure::error::InfraError;
use std::fs;
use std::path::{Path, PathBuf};

const DATABASE_FILE: &str = "chrono-tasks.sqlite";

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
    pub config: QueueConfig,
    pub store: SqliteDurableStore,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join(DATABASE_FILE);

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    let config = load_queue_config(&config_dir)?;
    let store = SqliteDurableStore::open(&database_path)?;

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        logs_dir,
        database_path,
        config,
        store,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::durable_store::DurableStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        root: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let root = std::env::temp_dir().join(format!(
                "chrono-tasks-bootstrap-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&root).expect("create temp workspace");
            Self { root }
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn creates_layout_default_config_and_database() {
        let workspace = TempWorkspace::new();
        let result = bootstrap_workspace(&workspace.root).expect("bootstrap");

        assert!(result.config_dir.join("app.json").exists());
        assert!(result.logs_dir.is_dir());
        assert!(result.database_path.exists());
        assert_eq!(result.database_path, workspace.root.join("state").join(DATABASE_FILE));
        assert_eq!(result.config, QueueConfig::default());
        assert_eq!(result.store.get("anything").expect("read store"), None);
    }

    #[test]
    fn rerun_keeps_existing_config_and_data() {
        let workspace = TempWorkspace::new();
        let first = bootstrap_workspace(&workspace.root).expect("first bootstrap");
        first.store.set("k", "v").expect("write store");
        fs::write(
            first.config_dir.join("app.json"),
            r#"{"schema":1,"apiBaseUrl":"https://tasks.example.test/api","maxRetries":5}"#,
        )
        .expect("write config");
        drop(first);

        let second = bootstrap_workspace(&workspace.root).expect("second bootstrap");
        assert_eq!(second.config.max_retries, 5);
        assert_eq!(second.config.api_base_url.as_str(), "https://tasks.example.test/api");
        assert_eq!(second.store.get("k").expect("read store"), Some("v".to_string()));
    }

    #[test]
    fn invalid_config_fails_bootstrap() {
        let workspace = TempWorkspace::new();
        let config_dir = workspace.root.join("config");
        fs::create_dir_all(&config_dir).expect("create config dir");
        fs::write(config_dir.join("app.json"), r#"{"schema":2}"#).expect("write config");

        let result = bootstrap_workspace(&workspace.root);
        assert!(matches!(result, Err(InfraError::InvalidConfig(_))));
    }
}
