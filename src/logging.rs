//! Replay-safe logging for orchestration code.
//!
//! An orchestration runs from the top on every turn, so plain `tracing` calls
//! inside it would repeat once per turn. These macros only emit while the
//! function executes past the recorded history.

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::debug!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`). Returns
/// false when a global subscriber is already set.
pub fn init_tracing() -> bool {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .is_ok()
}
