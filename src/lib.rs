pub mod application;
pub mod domain;
pub mod infrastructure;

use application::bootstrap::bootstrap_workspace;
use application::runtime::{connect_remote, SyncRuntime};
use infrastructure::credential_store::KeyringCredentialStore;
use infrastructure::error::InfraError;
use infrastructure::logging::init_logging;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Boots the workspace and keeps the sync runtime alive until Ctrl-C.
pub async fn run(workspace_root: &Path) -> Result<(), InfraError> {
    let bootstrap = bootstrap_workspace(workspace_root)?;
    init_logging(&bootstrap.logs_dir)?;
    info!(
        workspace_root = %bootstrap.workspace_root.display(),
        database_path = %bootstrap.database_path.display(),
        api_base_url = %bootstrap.config.api_base_url,
        "workspace ready"
    );

    let executor = connect_remote(
        &bootstrap.config,
        &KeyringCredentialStore::default(),
        |key| std::env::var(key).ok(),
    )?;
    let runtime = SyncRuntime::start(
        Arc::new(executor),
        Arc::new(bootstrap.store),
        &bootstrap.config,
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    runtime.shutdown().await;
    Ok(())
}
