//! wasm-bridge-host: Run wasm filter plugins behind a stable host API
//!
//! An embedding application launches named VMs, opens one stream per
//! traffic unit and drives the plugin's header hooks through the stream's
//! callback table. Plugins call back into the application through the
//! [`HostFunctions`] given at launch.
//!
//! ```rust,ignore
//! use wasm_bridge_host::{create_stream, delete_stream, launch_instance, VmConfig};
//! use wasm_bridge_api::Runtime;
//!
//! let vm = launch_instance(
//!     VmConfig::new("p1", "v1")
//!         .runtime(Runtime::Wasmtime)
//!         .file("filter.wasm"),
//!     None,
//! )
//! .expect("launch failed");
//!
//! let mut stream = create_stream(&vm, None)?;
//! stream.set_headers(headers, true, true)?;
//! let status = (stream.vm_functions.on_request_headers)(&stream, 2, false);
//! delete_stream(&mut stream)?;
//! ```

pub mod boundary;
pub mod config;
pub mod context;
pub mod engine;
pub mod headers;
pub mod host;
pub mod integration;
pub mod property;
pub mod registry;
pub mod runtime;
pub mod wasm;

pub use boundary::{
    create_stream, delete_stream, launch_instance, launch_instance_in, process_traffic,
    process_traffic_with, try_launch_instance, BridgeError, StreamCallbacks, StreamHandle,
    VmHandle, STREAM_HANDLE_MAGIC, VM_HANDLE_MAGIC,
};
pub use config::{CodeSource, VmConfig, VmSettings};
pub use context::{Context, ContextKind};
pub use engine::{EngineError, EngineFactory, Hook, PluginHost, WasmVm, WasmtimeVm};
pub use host::{
    HostCall, HostFunctionTable, HostFunctions, HostToken, NoHostFunctions, NoIntegration,
    VmIntegration,
};
pub use integration::IntegrationAdapter;
pub use property::PropertyTable;
pub use registry::{VmEntry, VmInfo, VmRegistry};
pub use runtime::{LaunchError, PluginDescriptor, RuntimeSelector};
pub use wasm::WasmInstance;
pub use wasm_bridge_api::{
    FilterHeadersStatus, HeaderMapType, HostError, HostResult, KvList, LogLevel, Pairs, Runtime,
    WasmResult,
};
