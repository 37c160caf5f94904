use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::storage::SessionStore;

/// Start the background idle-session sweep. Stops when `cancel` fires.
pub fn start_session_cleaner(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut interval_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval_timer.tick() => run_cleanup(store.as_ref()).await,
            }
        }
        debug!("Session cleaner stopped");
    })
}

async fn run_cleanup(store: &dyn SessionStore) {
    debug!("Running idle session cleanup");

    match store.cleanup().await {
        Ok(count) if count > 0 => debug!(sessions_cleaned = count, "Idle sessions cleaned"),
        Err(e) => error!(error = %e, "Failed to clean up idle sessions"),
        _ => {}
    }
}
