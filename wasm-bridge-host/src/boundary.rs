//! Boundary handles
//!
//! What an embedding application holds: a [`VmHandle`] per launched VM and
//! a [`StreamHandle`] per traffic unit. Both carry a magic tag that is
//! checked on every call and cleared when the handle is released.

use crate::config::VmConfig;
use crate::context::Context;
use crate::engine::{EngineError, PluginHost};
use crate::host::HostToken;
use crate::registry::{VmEntry, VmRegistry};
use crate::runtime::LaunchError;
use crate::wasm::WasmInstance;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use wasm_bridge_api::{FilterHeadersStatus, Pairs};

pub const VM_HANDLE_MAGIC: u32 = 0xc001_d00d;
pub const STREAM_HANDLE_MAGIC: u32 = 0xc001_babe;

/// Boundary error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum BridgeError {
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("out of memory")]
    NoMem,
    #[error("invalid code")]
    InvalidCode,
}

impl BridgeError {
    pub fn code(self) -> u32 {
        match self {
            Self::InvalidArgs => 1,
            Self::NoMem => 2,
            Self::InvalidCode => 3,
        }
    }
}

/// Handle of a launched VM
#[derive(Clone)]
pub struct VmHandle {
    magic: u32,
    entry: Arc<VmEntry>,
    host_context: Option<HostToken>,
}

impl VmHandle {
    pub fn is_valid(&self) -> bool {
        self.magic == VM_HANDLE_MAGIC
    }

    pub fn entry(&self) -> &Arc<VmEntry> {
        &self.entry
    }

    pub fn host_context(&self) -> Option<&HostToken> {
        self.host_context.as_ref()
    }

    pub fn project(&self) -> &str {
        self.entry.project()
    }

    pub fn vm_name(&self) -> &str {
        self.entry.name()
    }

    pub fn root_context(&self) -> &Arc<Context> {
        self.entry.root_context()
    }

    pub fn ready_shutdown(&self) -> bool {
        self.entry.ready_shutdown()
    }

    pub fn ready_delete(&self) -> bool {
        self.entry.ready_delete()
    }

    /// Invalidate this handle; the VM itself stays registered
    pub fn close(&mut self) {
        self.magic = 0;
    }
}

impl fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmHandle")
            .field("magic", &format_args!("{:#x}", self.magic))
            .field("vm", &self.entry.key())
            .finish_non_exhaustive()
    }
}

/// Per-stream entry points into the plugin
#[derive(Clone, Copy)]
pub struct StreamCallbacks {
    pub on_request_headers: fn(&StreamHandle, u32, bool) -> FilterHeadersStatus,
    pub on_response_headers: fn(&StreamHandle, u32, bool) -> FilterHeadersStatus,
    pub on_done: fn(&StreamHandle) -> bool,
    pub on_log: fn(&StreamHandle),
    pub on_delete: fn(&StreamHandle),
}

impl Default for StreamCallbacks {
    fn default() -> Self {
        Self {
            on_request_headers: handle_on_request_headers,
            on_response_headers: handle_on_response_headers,
            on_done: handle_on_done,
            on_log: handle_on_log,
            on_delete: handle_on_delete,
        }
    }
}

impl fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCallbacks").finish_non_exhaustive()
    }
}

/// Handle of one traffic unit
pub struct StreamHandle {
    magic: u32,
    context: Option<Arc<Context>>,
    host_context: Option<HostToken>,
    pub vm_functions: StreamCallbacks,
    vm: VmHandle,
}

impl StreamHandle {
    /// Stream tag intact, context not released and VM handle valid
    pub fn is_valid(&self) -> bool {
        self.magic == STREAM_HANDLE_MAGIC && self.context.is_some() && self.vm.is_valid()
    }

    pub fn context(&self) -> Option<&Arc<Context>> {
        self.context.as_ref()
    }

    pub fn host_context(&self) -> Option<&HostToken> {
        self.host_context.as_ref()
    }

    pub fn vm(&self) -> &VmHandle {
        &self.vm
    }

    pub fn set_headers(&self, pairs: Pairs, forward: bool, inbound: bool) -> Result<(), BridgeError> {
        let ctx = self.live_context().ok_or(BridgeError::InvalidArgs)?;
        ctx.set_headers(pairs, forward, inbound);
        Ok(())
    }

    fn live_context(&self) -> Option<&Arc<Context>> {
        if self.is_valid() {
            self.context.as_ref()
        } else {
            None
        }
    }

    /// Run one hook with the engine locked; the lock is gone before errors
    /// are reported back to the host
    fn run<T>(
        &self,
        hook: &str,
        f: impl FnOnce(&mut WasmInstance, &Arc<Context>) -> Result<T, EngineError>,
    ) -> Option<Result<T, (Arc<Context>, EngineError)>> {
        let Some(ctx) = self.live_context() else {
            tracing::warn!(hook, "Stream handle is not valid");
            return None;
        };
        let result = {
            let mut wasm = self.vm.entry.wasm();
            f(&mut *wasm, ctx)
        };
        Some(result.map_err(|e| {
            ctx.error(&format!("{} failed: {}", hook, e));
            (Arc::clone(ctx), e)
        }))
    }

    fn headers_status(
        &self,
        hook: &str,
        f: impl FnOnce(&mut WasmInstance, &Arc<Context>) -> Result<FilterHeadersStatus, EngineError>,
    ) -> FilterHeadersStatus {
        match self.run(hook, f) {
            None => FilterHeadersStatus::StopIteration,
            Some(Ok(status)) => status,
            Some(Err((ctx, _))) => {
                let fail_open = ctx.plugin().map_or(false, |p| p.fail_open);
                if fail_open {
                    FilterHeadersStatus::Continue
                } else {
                    FilterHeadersStatus::StopIteration
                }
            }
        }
    }
}

/// A handle dropped without [`delete_stream`] still releases its context
impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(ctx) = self.context.take() {
            self.vm.entry.wasm().remove_context(ctx.id());
            tracing::debug!(vm = %self.vm.entry.key(), context = ctx.id(), "Stream dropped");
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("magic", &format_args!("{:#x}", self.magic))
            .field("context", &self.context.as_ref().map(|c| c.id()))
            .field("vm", &self.vm)
            .finish_non_exhaustive()
    }
}

fn handle_on_request_headers(
    stream: &StreamHandle,
    num_headers: u32,
    end_of_stream: bool,
) -> FilterHeadersStatus {
    stream.headers_status("on_request_headers", |wasm, ctx| {
        wasm.on_request_headers(ctx, num_headers, end_of_stream)
    })
}

fn handle_on_response_headers(
    stream: &StreamHandle,
    num_headers: u32,
    end_of_stream: bool,
) -> FilterHeadersStatus {
    stream.headers_status("on_response_headers", |wasm, ctx| {
        wasm.on_response_headers(ctx, num_headers, end_of_stream)
    })
}

fn handle_on_done(stream: &StreamHandle) -> bool {
    match stream.run("on_done", |wasm, ctx| wasm.on_done(ctx)) {
        Some(Ok(done)) => done,
        // a failing plugin cannot hold the stream open
        Some(Err(_)) => true,
        None => false,
    }
}

fn handle_on_log(stream: &StreamHandle) {
    let _ = stream.run("on_log", |wasm, ctx| wasm.on_log(ctx));
}

fn handle_on_delete(stream: &StreamHandle) {
    let _ = stream.run("on_delete", |wasm, ctx| wasm.on_delete(ctx));
}

/// Launch (or find) the VM described by `config` in the global registry
///
/// Returns `None` on any failure; the reason is logged.
pub fn launch_instance(config: VmConfig, host_context: Option<HostToken>) -> Option<VmHandle> {
    try_launch_instance(config, host_context).ok()
}

pub fn try_launch_instance(
    config: VmConfig,
    host_context: Option<HostToken>,
) -> Result<VmHandle, LaunchError> {
    launch_instance_in(VmRegistry::global(), config, host_context)
}

/// Launch against a specific registry
pub fn launch_instance_in(
    registry: &VmRegistry,
    config: VmConfig,
    host_context: Option<HostToken>,
) -> Result<VmHandle, LaunchError> {
    if let Err(e) = config.validate() {
        tracing::warn!(vm = %config.key(), error = %e, "Rejected launch");
        return Err(e);
    }
    let entry = registry.launch(&config, host_context.clone())?;
    tracing::info!(vm = %entry.key(), "Launch instance success");
    Ok(VmHandle {
        magic: VM_HANDLE_MAGIC,
        entry,
        host_context,
    })
}

/// Create the context of a new traffic unit and run the plugin's create hook
pub fn create_stream(
    vm: &VmHandle,
    host_context: Option<HostToken>,
) -> Result<StreamHandle, BridgeError> {
    if !vm.is_valid() {
        return Err(BridgeError::InvalidArgs);
    }
    let root = Arc::clone(vm.entry.root_context());
    let created = vm.entry.wasm().create_context(&root, host_context.clone());
    let context = created.map_err(|e| {
        tracing::warn!(vm = %vm.entry.key(), error = %e, "Stream creation failed");
        BridgeError::InvalidCode
    })?;
    tracing::debug!(vm = %vm.entry.key(), context = context.id(), "Stream created");

    Ok(StreamHandle {
        magic: STREAM_HANDLE_MAGIC,
        context: Some(context),
        host_context,
        vm_functions: StreamCallbacks::default(),
        vm: vm.clone(),
    })
}

/// Release the stream's context; the handle is invalid afterwards
pub fn delete_stream(stream: &mut StreamHandle) -> Result<(), BridgeError> {
    if !stream.is_valid() {
        return Err(BridgeError::InvalidArgs);
    }
    stream.magic = 0;
    if let Some(ctx) = stream.context.take() {
        stream.vm.entry.wasm().remove_context(ctx.id());
        tracing::debug!(vm = %stream.vm.entry.key(), context = ctx.id(), "Stream deleted");
    }
    Ok(())
}

/// Feed a synthetic request through the stream
///
/// Headers `k1: v1`, `k2: v2` and `User-Agent: Shell` go to the request
/// hook. A status other than `Continue` is logged, not returned as error.
pub fn process_traffic(stream: &StreamHandle) -> Result<(), BridgeError> {
    let headers = vec![
        ("k1".to_string(), "v1".to_string()),
        ("k2".to_string(), "v2".to_string()),
        ("User-Agent".to_string(), "Shell".to_string()),
    ];
    process_traffic_with(stream, headers, true).map(|_| ())
}

/// Install `headers` as the inbound set and run the hook for `forward`
pub fn process_traffic_with(
    stream: &StreamHandle,
    headers: Pairs,
    forward: bool,
) -> Result<FilterHeadersStatus, BridgeError> {
    let ctx = stream.live_context().ok_or(BridgeError::InvalidArgs)?;
    let count = headers.len() as u32;
    ctx.set_headers(headers, forward, true);

    let status = if forward {
        (stream.vm_functions.on_request_headers)(stream, count, false)
    } else {
        (stream.vm_functions.on_response_headers)(stream, count, false)
    };
    if status != FilterHeadersStatus::Continue {
        tracing::info!(
            vm = %stream.vm.entry.key(),
            context = ctx.id(),
            status = ?status,
            "Plugin did not continue, skipping request"
        );
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeSelector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wasm_bridge_api::Runtime;

    fn registry() -> (VmRegistry, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let selector = RuntimeSelector::empty().with_engine(Runtime::Wasmtime, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            crate::engine::WasmtimeVm::boxed()
        });
        (VmRegistry::with_selector(selector), count)
    }

    fn config(code: &str) -> VmConfig {
        VmConfig::new("p1", "v1")
            .runtime(Runtime::Wasmtime)
            .data(code)
    }

    #[test]
    fn test_invalid_arguments_skip_selector() {
        let (registry, count) = registry();
        let bad = [
            VmConfig::new("", "v1").runtime(Runtime::Wasmtime).data("(module)"),
            VmConfig::new("p1", "v1").data("(module)"),
            VmConfig::new("p1", "v1").runtime(Runtime::Wasmtime),
        ];
        for config in bad {
            assert!(launch_instance_in(&registry, config, None).is_err());
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handles_are_tagged() {
        let (registry, _) = registry();
        let vm = launch_instance_in(&registry, config("(module)"), None).unwrap();
        assert!(vm.is_valid());

        let mut stream = create_stream(&vm, None).unwrap();
        assert!(stream.is_valid());
        assert_eq!(stream.context().unwrap().parent_id(), vm.root_context().id());

        delete_stream(&mut stream).unwrap();
        assert!(!stream.is_valid());
        assert_eq!(delete_stream(&mut stream), Err(BridgeError::InvalidArgs));
        assert_eq!(process_traffic(&stream), Err(BridgeError::InvalidArgs));
        assert_eq!(
            (stream.vm_functions.on_request_headers)(&stream, 0, false),
            FilterHeadersStatus::StopIteration
        );
    }

    #[test]
    fn test_dropped_stream_releases_context() {
        let (registry, _) = registry();
        let vm = launch_instance_in(&registry, config("(module)"), None).unwrap();
        {
            let _stream = create_stream(&vm, None).unwrap();
            assert!(!vm.ready_shutdown());
        }
        assert!(vm.ready_shutdown());
        assert_eq!(vm.entry().wasm().stream_count(), 0);

        // an explicit delete leaves nothing for drop to release
        let mut stream = create_stream(&vm, None).unwrap();
        delete_stream(&mut stream).unwrap();
        drop(stream);
        assert!(vm.ready_shutdown());
    }

    #[test]
    fn test_closed_vm_handle_rejected() {
        let (registry, _) = registry();
        let mut vm = launch_instance_in(&registry, config("(module)"), None).unwrap();
        let stream = create_stream(&vm, None).unwrap();
        vm.close();
        assert_eq!(create_stream(&vm, None).unwrap_err(), BridgeError::InvalidArgs);
        // the stream holds its own copy of the vm handle
        assert!(stream.is_valid());
    }

    #[test]
    fn test_process_traffic_directions() {
        let (registry, _) = registry();
        let wat = r#"(module
            (func (export "proxy_on_response_headers") (param i32 i32 i32) (result i32)
              i32.const 1))"#;
        let vm = launch_instance_in(&registry, config(wat), None).unwrap();
        let stream = create_stream(&vm, None).unwrap();

        process_traffic(&stream).unwrap();
        let ctx = stream.context().unwrap();
        assert_eq!(ctx.headers(true).len(), 3);
        assert!(ctx.forward_direction());

        let status =
            process_traffic_with(&stream, vec![("k".into(), "v".into())], false).unwrap();
        assert_eq!(status, FilterHeadersStatus::StopIteration);
        assert!(!ctx.forward_direction());
    }

    #[test]
    fn test_trapping_hook_fails_open() {
        let (registry, _) = registry();
        let wat = r#"(module
            (func (export "proxy_on_request_headers") (param i32 i32 i32) (result i32)
              unreachable)
            (func (export "proxy_on_done") (param i32) (result i32)
              unreachable))"#;
        let vm = launch_instance_in(&registry, config(wat), None).unwrap();
        let stream = create_stream(&vm, None).unwrap();

        assert_eq!(
            (stream.vm_functions.on_request_headers)(&stream, 1, true),
            FilterHeadersStatus::Continue
        );
        assert!((stream.vm_functions.on_done)(&stream));
    }

    #[test]
    fn test_failing_create_hook_rejects_stream() {
        let (registry, _) = registry();
        let wat = r#"(module
            (func (export "proxy_on_context_create") (param i32 i32)
              (if (i32.ne (local.get 1) (i32.const 0))
                (then unreachable))))"#;
        let vm = launch_instance_in(&registry, config(wat), None).unwrap();
        assert_eq!(create_stream(&vm, None).unwrap_err(), BridgeError::InvalidCode);
        assert!(vm.ready_shutdown());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(BridgeError::InvalidArgs.code(), 1);
        assert_eq!(BridgeError::NoMem.code(), 2);
        assert_eq!(BridgeError::InvalidCode.code(), 3);
    }
}
