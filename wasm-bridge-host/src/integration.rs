//! Engine integration adapter
//!
//! Connects an engine's internal trace/error/log-level hooks to the host's
//! [`VmIntegration`] and to `tracing`.

use crate::host::{NoIntegration, VmIntegration};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use wasm_bridge_api::LogLevel;

/// Adapter handed to an engine before code is loaded
pub struct IntegrationAdapter {
    functions: Arc<dyn VmIntegration>,
    // cached host code, used when the host keeps no level of its own
    log_level: AtomicU32,
    vm_key: String,
}

impl IntegrationAdapter {
    pub fn new(functions: Arc<dyn VmIntegration>, vm_key: impl Into<String>) -> Self {
        Self {
            functions,
            log_level: AtomicU32::new(LogLevel::default().host_code()),
            vm_key: vm_key.into(),
        }
    }

    /// Adapter with no host hooks
    pub fn detached(vm_key: impl Into<String>) -> Self {
        Self::new(Arc::new(NoIntegration), vm_key)
    }

    pub fn vm_key(&self) -> &str {
        &self.vm_key
    }

    pub fn log_level(&self) -> LogLevel {
        self.functions
            .get_log_level()
            .unwrap_or_else(|| LogLevel::from_host_code(self.log_level.load(Ordering::Relaxed)))
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.log_level.store(level.host_code(), Ordering::Relaxed);
        self.functions.set_log_level(level);
    }

    pub fn trace(&self, message: &str) {
        tracing::trace!(vm = %self.vm_key, "{}", message);
        self.functions.trace(message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(vm = %self.vm_key, "{}", message);
        self.functions.error(message);
    }
}

impl fmt::Debug for IntegrationAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationAdapter")
            .field("vm_key", &self.vm_key)
            .field("log_level", &self.log_level())
            .finish()
    }
}
