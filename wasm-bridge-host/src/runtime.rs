//! Runtime selection and the VM launch sequence

use crate::config::{CodeSource, VmConfig};
use crate::context::Context;
use crate::engine::{EngineError, EngineFactory, WasmtimeVm};
use crate::host::HostToken;
use crate::integration::IntegrationAdapter;
use crate::wasm::WasmInstance;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use wasm_bridge_api::{LogLevel, Runtime};

/// Errors that abort a launch
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Runtime not available: {0}")]
    RuntimeUnavailable(Runtime),

    #[error("Engine creation failed: {0}")]
    Engine(#[source] EngineError),

    #[error("Failed to read code from {}: {source}", path.display())]
    CodeRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Code is empty")]
    EmptyCode,

    #[error("Failed to load Wasm code: {0}")]
    Load(#[source] EngineError),

    #[error("Failed to initialize Wasm code: {0}")]
    Initialize(#[source] EngineError),

    #[error("Failed to start root context: {0}")]
    Start(#[source] EngineError),

    #[error("Root context rejected start")]
    StartRejected,

    #[error("Failed to configure Wasm: {0}")]
    Configure(#[source] EngineError),

    #[error("Plugin rejected configuration")]
    ConfigureRejected,
}

/// Identity and settings of a plugin running on a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    pub name: String,
    /// Project the plugin belongs to
    pub root_id: String,
    pub vm_id: String,
    /// Engine name, e.g. `wasmtime`
    pub engine: String,
    pub configuration: String,
    pub vm_configuration: String,
    pub fail_open: bool,
    pub log_level: LogLevel,
}

impl PluginDescriptor {
    pub fn new(project: &str, vm_name: &str, runtime: Runtime) -> Self {
        Self {
            name: vm_name.to_string(),
            root_id: project.to_string(),
            vm_id: vm_name.to_string(),
            engine: runtime.as_str().to_string(),
            configuration: String::new(),
            vm_configuration: String::new(),
            fail_open: true,
            log_level: LogLevel::default(),
        }
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Identifies the root context of this plugin within an engine
    pub fn key(&self) -> String {
        format!("{}||{}||{}", self.root_id, self.vm_id, self.configuration)
    }
}

/// A fully launched VM, not yet registered
pub struct LaunchedVm {
    pub wasm: WasmInstance,
    pub root_context: Arc<Context>,
    pub plugin: Arc<PluginDescriptor>,
    pub runtime: Runtime,
}

/// Maps runtimes to the factories that build their engines
///
/// The default selector knows wasmtime; other engines are installed by the
/// embedder.
#[derive(Clone)]
pub struct RuntimeSelector {
    factories: HashMap<Runtime, Arc<dyn EngineFactory>>,
}

impl Default for RuntimeSelector {
    fn default() -> Self {
        Self::empty().with_engine(Runtime::Wasmtime, WasmtimeVm::boxed)
    }
}

impl RuntimeSelector {
    /// Selector with no engines at all
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_engine(mut self, runtime: Runtime, factory: impl EngineFactory + 'static) -> Self {
        self.install(runtime, Arc::new(factory));
        self
    }

    pub fn install(&mut self, runtime: Runtime, factory: Arc<dyn EngineFactory>) {
        if runtime.is_valid() {
            self.factories.insert(runtime, factory);
        }
    }

    pub fn supports(&self, runtime: Runtime) -> bool {
        self.factories.contains_key(&runtime)
    }

    pub fn runtimes(&self) -> Vec<Runtime> {
        let mut runtimes: Vec<Runtime> = self.factories.keys().copied().collect();
        runtimes.sort_by_key(|r| r.code());
        runtimes
    }

    /// Build, load, start and configure a VM
    ///
    /// Every step is fatal; nothing is retried.
    pub fn build(
        &self,
        config: &VmConfig,
        host_token: Option<HostToken>,
    ) -> Result<LaunchedVm, LaunchError> {
        let key = config.key();

        // 1. Select engine
        let factory = self
            .factories
            .get(&config.runtime)
            .ok_or(LaunchError::RuntimeUnavailable(config.runtime))?;
        let mut vm = factory.create().map_err(LaunchError::Engine)?;
        tracing::debug!(vm = %key, runtime = %config.runtime, "Engine created");

        // 2. Install integration adapter
        let integration = Arc::new(IntegrationAdapter::new(
            Arc::clone(&config.integration),
            key.clone(),
        ));
        integration.set_log_level(config.log_level);
        vm.set_integration(integration);

        // 3. Describe the plugin
        let plugin = Arc::new(
            PluginDescriptor::new(&config.project_name, &config.vm_name, config.runtime)
                .with_log_level(config.log_level),
        );

        // 4. Resolve bytecode
        let source = config
            .code
            .as_ref()
            .ok_or(LaunchError::InvalidArgument("code source is missing"))?;
        let code = read_code(source)?;
        if code.is_empty() {
            return Err(LaunchError::EmptyCode);
        }
        tracing::debug!(vm = %key, source = %source, size = code.len(), "Code resolved");

        // 5. Load and initialize
        let mut wasm = WasmInstance::new(vm, &config.project_name, &config.vm_name);
        wasm.load(&code).map_err(LaunchError::Load)?;
        wasm.initialize().map_err(LaunchError::Initialize)?;

        // 6. Start root context
        let (root, started) = wasm
            .start(&plugin, Arc::clone(&config.host_functions), host_token)
            .map_err(LaunchError::Start)?;
        if !started {
            return Err(LaunchError::StartRejected);
        }

        // 7. Configure
        if !wasm.configure(&root).map_err(LaunchError::Configure)? {
            return Err(LaunchError::ConfigureRejected);
        }

        tracing::debug!(vm = %key, root_context = root.id(), "VM started");
        Ok(LaunchedVm {
            wasm,
            root_context: root,
            plugin,
            runtime: config.runtime,
        })
    }
}

impl fmt::Debug for LaunchedVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedVm")
            .field("root_context", &self.root_context)
            .field("plugin", &self.plugin)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for RuntimeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeSelector")
            .field("runtimes", &self.runtimes())
            .finish()
    }
}

/// Bytecode of a code source
pub fn read_code(source: &CodeSource) -> Result<Vec<u8>, LaunchError> {
    match source {
        CodeSource::Data(bytes) => Ok(bytes.clone()),
        CodeSource::File(path) => read_file(path).map_err(|source| LaunchError::CodeRead {
            path: path.clone(),
            source,
        }),
    }
}

fn read_file(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    let len = usize::try_from(len).map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
    let mut code = vec![0; len];
    file.read_exact(&mut code)?;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(code: &str) -> VmConfig {
        VmConfig::new("p1", "v1")
            .runtime(Runtime::Wasmtime)
            .data(code)
    }

    #[test]
    fn test_descriptor_defaults() {
        let plugin = PluginDescriptor::new("p1", "v1", Runtime::Wasmtime);
        assert_eq!(plugin.name, "v1");
        assert_eq!(plugin.root_id, "p1");
        assert_eq!(plugin.engine, "wasmtime");
        assert!(plugin.configuration.is_empty());
        assert!(plugin.fail_open);
    }

    #[test]
    fn test_build_minimal_module() {
        let launched = RuntimeSelector::default()
            .build(&config("(module)"), None)
            .unwrap();
        assert_eq!(launched.runtime, Runtime::Wasmtime);
        assert!(launched.root_context.is_root());
        assert_eq!(launched.root_context.project(), "p1");
        assert!(launched.wasm.ready_shutdown());
    }

    #[test]
    fn test_unavailable_runtime() {
        let err = RuntimeSelector::default()
            .build(&config("(module)").runtime(Runtime::WasmEdge), None)
            .unwrap_err();
        assert!(matches!(err, LaunchError::RuntimeUnavailable(Runtime::WasmEdge)));
    }

    #[test]
    fn test_installed_factory_is_used() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let selector = RuntimeSelector::empty().with_engine(Runtime::Wamr, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            WasmtimeVm::boxed()
        });
        assert!(selector.supports(Runtime::Wamr));
        assert!(!selector.supports(Runtime::Wasmtime));

        selector
            .build(&config("(module)").runtime(Runtime::Wamr), None)
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_and_invalid_code() {
        let selector = RuntimeSelector::default();
        assert!(matches!(
            selector.build(&config(""), None),
            Err(LaunchError::EmptyCode)
        ));
        assert!(matches!(
            selector.build(&config("not wasm at all"), None),
            Err(LaunchError::Load(_))
        ));
    }

    #[test]
    fn test_rejections_are_fatal() {
        let selector = RuntimeSelector::default();
        let reject_start = r#"(module
            (func (export "proxy_on_vm_start") (param i32 i32) (result i32) i32.const 0))"#;
        assert!(matches!(
            selector.build(&config(reject_start), None),
            Err(LaunchError::StartRejected)
        ));

        let reject_configure = r#"(module
            (func (export "proxy_on_configure") (param i32 i32) (result i32) i32.const 0))"#;
        assert!(matches!(
            selector.build(&config(reject_configure), None),
            Err(LaunchError::ConfigureRejected)
        ));

        let trap_initialize = r#"(module (func (export "_initialize") unreachable))"#;
        assert!(matches!(
            selector.build(&config(trap_initialize), None),
            Err(LaunchError::Initialize(_))
        ));
    }

    #[test]
    fn test_code_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"(module)").unwrap();
        let source = CodeSource::File(file.path().to_path_buf());
        assert_eq!(read_code(&source).unwrap(), b"(module)".to_vec());

        let missing = CodeSource::File(PathBuf::from("/nonexistent/filter.wasm"));
        assert!(matches!(
            read_code(&missing),
            Err(LaunchError::CodeRead { .. })
        ));
    }

    #[test]
    fn test_integration_receives_level() {
        let launched = RuntimeSelector::default()
            .build(&config("(module)").log_level(LogLevel::Error), None)
            .unwrap();
        let level = launched
            .wasm
            .vm()
            .integration()
            .map(|i| i.log_level());
        assert_eq!(level, Some(LogLevel::Error));
        assert_eq!(launched.plugin.log_level, LogLevel::Error);
    }
}
