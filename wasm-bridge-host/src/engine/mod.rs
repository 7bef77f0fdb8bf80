//! Execution engine seam
//!
//! An engine compiles plugin bytecode, links the host ABI and runs the
//! lifecycle hooks of a plugin. The bridge only talks to engines through
//! [`WasmVm`]; [`EngineFactory`] builds a fresh engine per launch.

mod wasmtime_vm;

pub use wasmtime_vm::WasmtimeVm;

use crate::integration::IntegrationAdapter;
use std::sync::Arc;
use thiserror::Error;
use wasm_bridge_api::{HeaderMapType, HostResult, LogLevel, Pairs, Runtime};

/// Errors raised by an engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("No module loaded")]
    NotLoaded,

    #[error("Module not initialized")]
    NotInitialized,
}

/// Context-side services a running plugin can call
///
/// Implemented by [`crate::Context`]; engines hold it only for the duration
/// of a hook call.
pub trait PluginHost: Send + Sync {
    fn context_id(&self) -> u32;

    fn log(&self, level: LogLevel, message: &str) -> HostResult<()>;

    fn get_property(&self, path: &str) -> HostResult<String>;

    fn get_header_map_value(&self, map: HeaderMapType, key: &str) -> HostResult<String>;

    fn add_header_map_value(&self, map: HeaderMapType, key: &str, value: &str) -> HostResult<()>;

    fn get_header_map_pairs(&self, map: HeaderMapType) -> HostResult<Pairs>;

    /// Wall clock in nanoseconds, 0 on failure
    fn current_time_nanos(&self) -> u64;

    /// Monotonic clock in nanoseconds, 0 on failure
    fn monotonic_time_nanos(&self) -> u64;

    fn error(&self, message: &str);
}

/// Lifecycle hook of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    ContextCreate { context_id: u32, parent_id: u32 },
    VmStart { root_id: u32, configuration_size: u32 },
    Configure { root_id: u32, configuration_size: u32 },
    RequestHeaders {
        context_id: u32,
        num_headers: u32,
        end_of_stream: bool,
    },
    ResponseHeaders {
        context_id: u32,
        num_headers: u32,
        end_of_stream: bool,
    },
    Done { context_id: u32 },
    Log { context_id: u32 },
    Delete { context_id: u32 },
}

impl Hook {
    /// Export implementing this hook
    pub fn export_name(&self) -> &'static str {
        match self {
            Self::ContextCreate { .. } => "proxy_on_context_create",
            Self::VmStart { .. } => "proxy_on_vm_start",
            Self::Configure { .. } => "proxy_on_configure",
            Self::RequestHeaders { .. } => "proxy_on_request_headers",
            Self::ResponseHeaders { .. } => "proxy_on_response_headers",
            Self::Done { .. } => "proxy_on_done",
            Self::Log { .. } => "proxy_on_log",
            Self::Delete { .. } => "proxy_on_delete",
        }
    }

    /// Arguments in ABI order
    pub fn args(&self) -> Vec<u32> {
        match *self {
            Self::ContextCreate {
                context_id,
                parent_id,
            } => vec![context_id, parent_id],
            Self::VmStart {
                root_id,
                configuration_size,
            }
            | Self::Configure {
                root_id,
                configuration_size,
            } => vec![root_id, configuration_size],
            Self::RequestHeaders {
                context_id,
                num_headers,
                end_of_stream,
            }
            | Self::ResponseHeaders {
                context_id,
                num_headers,
                end_of_stream,
            } => vec![context_id, num_headers, u32::from(end_of_stream)],
            Self::Done { context_id } | Self::Log { context_id } | Self::Delete { context_id } => {
                vec![context_id]
            }
        }
    }

    pub fn context_id(&self) -> u32 {
        self.args()[0]
    }
}

/// A WASM execution engine instance
pub trait WasmVm: Send {
    fn runtime(&self) -> Runtime;

    /// Install the integration adapter; called before `load`
    fn set_integration(&mut self, integration: Arc<IntegrationAdapter>);

    fn integration(&self) -> Option<&Arc<IntegrationAdapter>>;

    /// Compile and validate bytecode
    fn load(&mut self, code: &[u8]) -> Result<(), EngineError>;

    /// Link the host ABI, instantiate and run the module's initializer
    fn initialize(&mut self) -> Result<(), EngineError>;

    /// Invoke a hook on behalf of `host`
    ///
    /// Returns `None` when the plugin does not export the hook, otherwise
    /// the hook's return value (0 for hooks without one).
    fn call(&mut self, host: Arc<dyn PluginHost>, hook: Hook) -> Result<Option<u32>, EngineError>;
}

/// Builds engines for one runtime
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn WasmVm>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn WasmVm>, EngineError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn WasmVm>, EngineError> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_args_in_abi_order() {
        let hook = Hook::RequestHeaders {
            context_id: 3,
            num_headers: 2,
            end_of_stream: true,
        };
        assert_eq!(hook.export_name(), "proxy_on_request_headers");
        assert_eq!(hook.args(), vec![3, 2, 1]);
        assert_eq!(hook.context_id(), 3);

        let create = Hook::ContextCreate {
            context_id: 4,
            parent_id: 1,
        };
        assert_eq!(create.args(), vec![4, 1]);
        assert_eq!(Hook::Delete { context_id: 9 }.args(), vec![9]);
    }

    #[test]
    fn test_closure_factory() {
        let factory = || WasmtimeVm::new().map(|vm| Box::new(vm) as Box<dyn WasmVm>);
        let vm = factory.create().unwrap();
        assert_eq!(vm.runtime(), Runtime::Wasmtime);
    }
}
