//! Connection tuning knobs.
//!
//! Defaults can be overridden programmatically through
//! [`ConnectionConfig`] or, for quick operational tweaks, via
//! environment variables.

use std::collections::HashSet;
use std::time::Duration;

/// Scrollback budget per stream.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 64 * 1024;

/// Detached-queue budget per stream. Larger than the scrollback so a
/// short detached window loses nothing.
pub const DEFAULT_DETACHED_BYTES: usize = 256 * 1024;

/// Per-call RPC deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `Connection::ready` waits for the transport by default.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// Default per-call timeout, honoring `BRIDGEMUX_CALL_TIMEOUT_MS`.
pub fn call_timeout() -> Duration {
    std::env::var("BRIDGEMUX_CALL_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_CALL_TIMEOUT)
}

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Scrollback ring capacity, bytes.
    pub scrollback_bytes: usize,
    /// Detached-queue budget, bytes.
    pub detached_bytes: usize,
    /// Stream kinds that are reused while open instead of re-opened.
    pub persistent_kinds: HashSet<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let mut persistent_kinds = HashSet::new();
        persistent_kinds.insert("terminal".to_owned());
        Self {
            scrollback_bytes: env_usize("BRIDGEMUX_SCROLLBACK_BYTES", DEFAULT_SCROLLBACK_BYTES),
            detached_bytes: env_usize("BRIDGEMUX_DETACHED_BYTES", DEFAULT_DETACHED_BYTES),
            persistent_kinds,
        }
    }
}

impl ConnectionConfig {
    /// Mark an additional stream kind as reusable while open.
    pub fn persistent(mut self, kind: &str) -> Self {
        self.persistent_kinds.insert(kind.to_owned());
        self
    }
}
