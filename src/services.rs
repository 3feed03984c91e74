//! Process-wide shared [`QaService`].
//!
//! Model-backed providers and the loaded index are expensive, so the CLI and
//! the HTTP server share one [`QaService`] per process. It is built lazily on
//! first access; the lock guarantees a single construction even when the
//! first calls race. [`reset_shared_services`] drops it so tests can start
//! from a clean slate.

use anyhow::Result;
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::Config;
use crate::qa::QaService;

static SHARED: OnceLock<Mutex<Option<Arc<QaService>>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<Arc<QaService>>> {
    SHARED.get_or_init(|| Mutex::new(None))
}

/// The shared service, constructing it from `config` on first use.
///
/// Later calls return the existing instance regardless of `config`.
pub fn shared_services(config: &Config) -> Result<Arc<QaService>> {
    let mut guard = slot().lock().unwrap();
    if let Some(service) = guard.as_ref() {
        return Ok(service.clone());
    }
    let service = Arc::new(QaService::from_config(config)?);
    *guard = Some(service.clone());
    tracing::debug!("services.initialised");
    Ok(service)
}

/// Install a pre-built service, replacing any existing one.
pub fn install_shared_services(service: Arc<QaService>) {
    *slot().lock().unwrap() = Some(service);
}

/// Drop the shared service. The next [`shared_services`] call rebuilds it.
pub fn reset_shared_services() {
    *slot().lock().unwrap() = None;
    tracing::debug!("services.reset");
}
