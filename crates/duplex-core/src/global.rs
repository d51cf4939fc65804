//! Process-wide configuration shared by every session.
//!
//! Set up once before the first session is constructed. Every setter is
//! idempotent and may be called again to reconfigure; sessions read the
//! current values when they are constructed, so reconfiguration only affects
//! sessions created afterwards.

use crate::config::{ServerConfig, SessionConfig};
use crate::error::CallError;
use std::sync::{Arc, OnceLock, RwLock};

/// Highest relay layer this build speaks.
pub const MAX_LAYER: i32 = 92;

/// Protocol versions this build implements.
pub const SUPPORTED_VERSIONS: &[&str] = &["2.4.4", "3.0.0"];

/// Versions only offered when the reference implementation is requested.
pub const REFERENCE_VERSIONS: &[&str] = &["2.7.7"];

/// Sink receiving every session debug-log line.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct GlobalState {
    log_sink: Option<LogSink>,
    server_config: ServerConfig,
}

fn state() -> &'static RwLock<GlobalState> {
    static STATE: OnceLock<RwLock<GlobalState>> = OnceLock::new();
    STATE.get_or_init(|| RwLock::new(GlobalState::default()))
}

/// Register, replace or (with `None`) clear the logging sink.
pub fn setup_logging_function(sink: Option<LogSink>) {
    let mut guard = state().write().unwrap_or_else(|e| e.into_inner());
    guard.log_sink = sink;
}

/// Apply a JSON server config blob; `None` restores the defaults.
///
/// # Errors
///
/// Returns [`CallError::ServerConfig`] for a malformed blob, or for one
/// whose overrides would leave the session timings inconsistent. The
/// previous configuration stays in effect.
pub fn apply_server_config(data: Option<&str>) -> Result<(), CallError> {
    let parsed = match data {
        Some(data) => ServerConfig::from_json(data).map_err(|e| {
            tracing::warn!("Rejected server config: {}", e);
            CallError::ServerConfig(e.to_string())
        })?,
        None => ServerConfig::default(),
    };

    if let Err(reason) = SessionConfig::default().with_overrides(&parsed).validate() {
        tracing::warn!("Rejected server config: {}", reason);
        return Err(CallError::ServerConfig(reason.to_string()));
    }

    let mut guard = state().write().unwrap_or_else(|e| e.into_inner());
    if guard.server_config != parsed {
        tracing::info!("Server config updated: {:?}", parsed);
        guard.server_config = parsed;
    }
    Ok(())
}

/// Session defaults with the current server config applied.
#[must_use]
pub fn session_config() -> SessionConfig {
    let guard = state().read().unwrap_or_else(|e| e.into_inner());
    SessionConfig::default().with_overrides(&guard.server_config)
}

/// Forward a line to the registered logging sink, if any.
pub(crate) fn emit_log(line: &str) {
    let sink = {
        let guard = state().read().unwrap_or_else(|e| e.into_inner());
        guard.log_sink.clone()
    };
    if let Some(sink) = sink {
        sink(line);
    }
}

/// Highest relay layer this build speaks.
#[must_use]
pub fn max_layer() -> i32 {
    MAX_LAYER
}

/// Supported protocol versions, optionally including reference versions.
#[must_use]
pub fn versions(include_reference: bool) -> Vec<String> {
    let mut versions: Vec<String> = SUPPORTED_VERSIONS.iter().map(|v| (*v).to_string()).collect();
    if include_reference {
        versions.extend(REFERENCE_VERSIONS.iter().map(|v| (*v).to_string()));
    }
    versions
}

/// Whether `version` may be used to construct a session.
#[must_use]
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version) || REFERENCE_VERSIONS.contains(&version)
}
