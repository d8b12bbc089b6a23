//! Background tasks for the seisws server.
//!
//! Includes:
//! - Reloading access rules and users on SIGHUP.

use crate::{load_acl, load_users, AppState, StartupError};
use std::sync::Arc;

/// Re-reads access rules and the users file and swaps them in.
///
/// Requests already running keep the snapshots they started with. On
/// failure nothing is swapped.
pub async fn reload_access(state: Arc<AppState>) -> Result<(), StartupError> {
    let (acl, users) = {
        let state = Arc::clone(&state);
        tokio::task::spawn_blocking(move || {
            let acl = load_acl(&state.pool)?;
            let users = load_users(state.users_file.as_ref())?;
            Ok::<_, StartupError>((acl, users))
        })
        .await
        .map_err(|e| StartupError::Task(e.to_string()))??
    };

    tracing::info!(rules = acl.len(), users = users.len(), "access configuration reloaded");
    state.acl.store(acl);
    state.users.store(users);
    Ok(())
}

/// Reloads access configuration every time the process receives SIGHUP.
#[cfg(unix)]
pub async fn start_reload_task(state: Arc<AppState>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("failed to install SIGHUP handler: {}", e);
            return;
        }
    };
    tracing::info!("access reload on SIGHUP enabled");

    while hangup.recv().await.is_some() {
        tracing::info!("received SIGHUP, reloading access configuration");
        if let Err(e) = reload_access(Arc::clone(&state)).await {
            tracing::error!("access reload failed, keeping previous configuration: {}", e);
        }
    }
}

#[cfg(not(unix))]
pub async fn start_reload_task(_state: Arc<AppState>) {
    tracing::warn!("access reload on SIGHUP is not available on this platform");
}
