//! Execution contexts
//!
//! Every engine instance owns a small tree of contexts: the VM context
//! (id 0), one root context per plugin and any number of derived stream
//! contexts. A root is its own parent. Contexts live in the arena of
//! [`crate::WasmInstance`] and are shared with handles through `Arc`.

use crate::engine::PluginHost;
use crate::headers::{collect_pairs, HeaderSnapshot};
use crate::host::{HostCall, HostFunctions, HostToken, NoHostFunctions};
use crate::runtime::PluginDescriptor;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use wasm_bridge_api::{HeaderMapType, HostError, HostResult, LogLevel, Pairs};

/// Position of a context in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// Engine-level context, id 0
    Vm,
    /// Long-lived context of a plugin
    Root,
    /// Short-lived context of one traffic unit
    Stream,
}

#[derive(Debug, Default)]
struct ContextState {
    headers: HeaderSnapshot,
    in_log_phase: bool,
}

pub struct Context {
    id: u32,
    parent_id: u32,
    kind: ContextKind,
    project: String,
    vm_name: String,
    plugin: Option<Arc<PluginDescriptor>>,
    host_functions: Arc<dyn HostFunctions>,
    host_token: Option<HostToken>,
    state: Mutex<ContextState>,
}

impl Context {
    pub(crate) fn vm(project: &str, vm_name: &str) -> Self {
        Self {
            id: 0,
            parent_id: 0,
            kind: ContextKind::Vm,
            project: project.to_string(),
            vm_name: vm_name.to_string(),
            plugin: None,
            host_functions: Arc::new(NoHostFunctions),
            host_token: None,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub(crate) fn root(
        id: u32,
        plugin: Arc<PluginDescriptor>,
        host_functions: Arc<dyn HostFunctions>,
        host_token: Option<HostToken>,
    ) -> Self {
        Self {
            id,
            parent_id: id,
            kind: ContextKind::Root,
            project: plugin.root_id.clone(),
            vm_name: plugin.vm_id.clone(),
            plugin: Some(plugin),
            host_functions,
            host_token,
            state: Mutex::new(ContextState::default()),
        }
    }

    /// Child of `parent`
    ///
    /// The host table is immutable after launch, so the child holds its own
    /// reference to the parent's table and keeps it after the parent is gone.
    pub(crate) fn derived(id: u32, parent: &Context, host_token: Option<HostToken>) -> Self {
        Self {
            id,
            parent_id: parent.id,
            kind: ContextKind::Stream,
            project: parent.project.clone(),
            vm_name: parent.vm_name.clone(),
            plugin: parent.plugin.clone(),
            host_functions: Arc::clone(&parent.host_functions),
            host_token,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn parent_id(&self) -> u32 {
        self.parent_id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn is_root(&self) -> bool {
        self.parent_id == self.id
    }

    pub fn is_stream(&self) -> bool {
        self.kind == ContextKind::Stream
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn plugin(&self) -> Option<&Arc<PluginDescriptor>> {
        self.plugin.as_ref()
    }

    pub fn host_token(&self) -> Option<&HostToken> {
        self.host_token.as_ref()
    }

    pub fn host_functions(&self) -> &Arc<dyn HostFunctions> {
        &self.host_functions
    }

    /// Install a header set for the current traffic unit
    pub fn set_headers(&self, pairs: Pairs, forward: bool, inbound: bool) {
        self.state().headers.set(pairs, forward, inbound);
    }

    pub fn headers(&self, inbound: bool) -> Pairs {
        let state = self.state();
        if inbound {
            state.headers.inbound().clone()
        } else {
            state.headers.outbound().clone()
        }
    }

    pub fn forward_direction(&self) -> bool {
        self.state().headers.forward_direction()
    }

    pub fn in_log_phase(&self) -> bool {
        self.state().in_log_phase
    }

    pub(crate) fn enter_log_phase(&self) {
        self.state().in_log_phase = true;
    }

    pub fn host_call(&self) -> HostCall<'_> {
        HostCall {
            project: &self.project,
            vm_name: &self.vm_name,
            context_id: self.id,
            is_stream: self.is_stream(),
            token: self.host_token.as_ref(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, level: LogLevel, message: &str) {
        let (project, vm, context) = (&self.project, &self.vm_name, self.id);
        match level {
            LogLevel::Trace => tracing::trace!(project = %project, vm = %vm, context, "{}", message),
            LogLevel::Debug => tracing::debug!(project = %project, vm = %vm, context, "{}", message),
            LogLevel::Info => tracing::info!(project = %project, vm = %vm, context, "{}", message),
            LogLevel::Warn => tracing::warn!(project = %project, vm = %vm, context, "{}", message),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(project = %project, vm = %vm, context, "{}", message)
            }
        }
    }
}

impl PluginHost for Context {
    fn context_id(&self) -> u32 {
        self.id
    }

    fn log(&self, level: LogLevel, message: &str) -> HostResult<()> {
        let result = self.host_functions.log(&self.host_call(), level, message);
        if result == Err(HostError::Unimplemented) {
            self.emit(level, message);
        }
        result
    }

    fn get_property(&self, path: &str) -> HostResult<String> {
        self.host_functions.get_property(&self.host_call(), path)
    }

    fn get_header_map_value(&self, map: HeaderMapType, key: &str) -> HostResult<String> {
        if let Some(found) = self.state().headers.value(map, key) {
            return found;
        }
        match self
            .host_functions
            .get_header_map_value(&self.host_call(), map, key)
        {
            Err(HostError::Unimplemented) if !map.is_live() => Ok(String::new()),
            other => other,
        }
    }

    fn add_header_map_value(&self, map: HeaderMapType, key: &str, value: &str) -> HostResult<()> {
        if map.is_immutable() || self.in_log_phase() {
            return Err(HostError::BadArgument);
        }
        if self.state().headers.append(map, key, value) {
            return Ok(());
        }
        self.host_functions
            .add_header_map_value(&self.host_call(), map, key, value)
    }

    fn get_header_map_pairs(&self, map: HeaderMapType) -> HostResult<Pairs> {
        if let Some(pairs) = self.state().headers.live(map) {
            return Ok(pairs.clone());
        }
        match self
            .host_functions
            .get_header_map_pairs(&self.host_call(), map)
        {
            Ok(list) => Ok(collect_pairs(list)),
            Err(HostError::Unimplemented) if !map.is_live() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn current_time_nanos(&self) -> u64 {
        self.host_functions.current_time_nanos().unwrap_or(0)
    }

    fn monotonic_time_nanos(&self) -> u64 {
        self.host_functions.monotonic_time_nanos().unwrap_or(0)
    }

    fn error(&self, message: &str) {
        tracing::error!(
            project = %self.project,
            vm = %self.vm_name,
            context = self.id,
            "Context error: {}",
            message
        );
        let _ = self.host_functions.error(&self.host_call(), message);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("kind", &self.kind)
            .field("project", &self.project)
            .field("vm_name", &self.vm_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostFunctionTable;
    use crate::property::{PropertyTable, PLUGIN_ROOT_ID};
    use wasm_bridge_api::KvList;

    fn plugin() -> Arc<PluginDescriptor> {
        Arc::new(PluginDescriptor::new("p1", "v1", wasm_bridge_api::Runtime::Wasmtime))
    }

    fn pairs(items: &[(&str, &str)]) -> Pairs {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_root_and_derived_linkage() {
        let root = Context::root(1, plugin(), Arc::new(NoHostFunctions), None);
        assert!(root.is_root());
        assert!(!root.is_stream());
        assert_eq!(root.project(), "p1");
        assert_eq!(root.vm_name(), "v1");

        let stream = Context::derived(2, &root, None);
        assert_eq!(stream.parent_id(), 1);
        assert!(stream.is_stream());
        assert!(!stream.is_root());
        assert!(Arc::ptr_eq(stream.host_functions(), root.host_functions()));
    }

    #[test]
    fn test_derived_keeps_host_table_after_parent_dropped() {
        let host = HostFunctionTable::new().with_get_property(|_, path| Ok(format!("got {}", path)));
        let root = Context::root(1, plugin(), Arc::new(host), None);
        let stream = Context::derived(2, &root, None);
        drop(root);

        assert_eq!(stream.get_property("x"), Ok("got x".to_string()));
    }

    #[test]
    fn test_absent_slots_are_unimplemented() {
        let root = Context::root(1, plugin(), Arc::new(NoHostFunctions), None);
        assert_eq!(
            root.log(LogLevel::Info, "hello"),
            Err(HostError::Unimplemented)
        );
        assert_eq!(
            root.get_property(PLUGIN_ROOT_ID),
            Err(HostError::Unimplemented)
        );
        assert_eq!(
            root.get_header_map_pairs(HeaderMapType::RequestHeaders),
            Err(HostError::Unimplemented)
        );
        assert_eq!(root.current_time_nanos(), 0);
        assert_eq!(root.monotonic_time_nanos(), 0);
    }

    #[test]
    fn test_non_live_maps_are_empty_without_host() {
        let root = Context::root(1, plugin(), Arc::new(NoHostFunctions), None);
        assert_eq!(
            root.get_header_map_pairs(HeaderMapType::RequestTrailers),
            Ok(Vec::new())
        );
        assert_eq!(
            root.get_header_map_value(HeaderMapType::GrpcReceiveInitialMetadata, "k"),
            Ok(String::new())
        );
    }

    #[test]
    fn test_pairs_come_from_snapshot_first() {
        let host = HostFunctionTable::new().with_get_header_map_pairs(|_, _| {
            Ok(vec![("from", "host")].into_iter().collect::<KvList>())
        });
        let root = Context::root(1, plugin(), Arc::new(host), None);
        let stream = Context::derived(2, &root, None);

        assert_eq!(
            stream.get_header_map_pairs(HeaderMapType::RequestHeaders),
            Ok(pairs(&[("from", "host")]))
        );

        stream.set_headers(pairs(&[("User-Agent", "Shell"), ("k1", "v1")]), true, true);
        let first = stream.get_header_map_pairs(HeaderMapType::RequestHeaders);
        let second = stream.get_header_map_pairs(HeaderMapType::RequestHeaders);
        assert_eq!(first, Ok(pairs(&[("User-Agent", "Shell"), ("k1", "v1")])));
        assert_eq!(first, second);

        // the reverse map is not backed by the forward snapshot
        assert_eq!(
            stream.get_header_map_pairs(HeaderMapType::ResponseHeaders),
            Ok(pairs(&[("from", "host")]))
        );
    }

    #[test]
    fn test_add_then_read_header() {
        let root = Context::root(1, plugin(), Arc::new(NoHostFunctions), None);
        let stream = Context::derived(2, &root, None);
        stream.set_headers(pairs(&[("k1", "v1")]), true, true);

        stream
            .add_header_map_value(HeaderMapType::RequestHeaders, "k2", "v2")
            .unwrap();
        assert_eq!(
            stream.get_header_map_value(HeaderMapType::RequestHeaders, "k2"),
            Ok("v2".to_string())
        );
        assert_eq!(
            stream.get_header_map_value(HeaderMapType::RequestHeaders, "missing"),
            Err(HostError::NotFound)
        );
    }

    #[test]
    fn test_writes_rejected_in_log_phase_and_for_immutable_maps() {
        let root = Context::root(1, plugin(), Arc::new(NoHostFunctions), None);
        let stream = Context::derived(2, &root, None);
        stream.set_headers(pairs(&[("k1", "v1")]), true, true);

        assert_eq!(
            stream.add_header_map_value(HeaderMapType::HttpCallResponseHeaders, "k", "v"),
            Err(HostError::BadArgument)
        );

        stream.enter_log_phase();
        assert_eq!(
            stream.add_header_map_value(HeaderMapType::RequestHeaders, "k", "v"),
            Err(HostError::BadArgument)
        );
        assert_eq!(stream.headers(true).len(), 1);
    }

    #[test]
    fn test_property_through_host_table() {
        let table = PropertyTable::new();
        let host = HostFunctionTable::new().with_get_property(move |call, path| table.lookup(call, path));
        let root = Context::root(1, plugin(), Arc::new(host), None);
        let stream = Context::derived(2, &root, None);
        assert_eq!(stream.get_property(PLUGIN_ROOT_ID), Ok("p1".to_string()));
        assert_eq!(stream.get_property("x\0y"), Err(HostError::NotFound));
    }

    #[test]
    fn test_error_reaches_host_and_token_is_per_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let host = HostFunctionTable::new().with_error(move |call, msg| {
            let tag = call.token_as::<&'static str>().copied().unwrap_or("none");
            sink.lock().unwrap().push(format!("{}:{}", tag, msg));
            Ok(())
        });
        let root_token: HostToken = Arc::new("vm");
        let stream_token: HostToken = Arc::new("stream");
        let root = Context::root(1, plugin(), Arc::new(host), Some(root_token));
        let stream = Context::derived(2, &root, Some(stream_token));

        root.error("first");
        stream.error("second");
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["vm:first", "stream:second"]
        );
    }
}
