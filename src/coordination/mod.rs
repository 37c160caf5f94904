//! Cross-instance coordination of the token refresh cycle

mod scheduler;

pub use scheduler::{
    refresh_window_key, RefreshScheduler, SchedulerHandle, TickOutcome, REFRESH_LOCK_NAMESPACE,
};
