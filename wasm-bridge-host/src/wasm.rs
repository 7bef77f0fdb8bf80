//! Engine instance and its context arena
//!
//! [`WasmInstance`] wraps one engine and owns every context created on it.
//! Contexts are indexed by id; a root context is found by walking parent
//! ids until a context is its own parent.

use crate::context::Context;
use crate::engine::{EngineError, Hook, PluginHost, WasmVm};
use crate::host::{HostFunctions, HostToken};
use crate::runtime::PluginDescriptor;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use wasm_bridge_api::{FilterHeadersStatus, Runtime};

pub struct WasmInstance {
    vm: Box<dyn WasmVm>,
    project: String,
    vm_name: String,
    next_context_id: u32,
    contexts: HashMap<u32, Arc<Context>>,
    /// plugin key -> root context id
    root_contexts: HashMap<String, u32>,
    timer_period: HashMap<u32, Duration>,
    pending_done: BTreeSet<u32>,
    pending_delete: BTreeSet<u32>,
}

impl WasmInstance {
    pub fn new(vm: Box<dyn WasmVm>, project: impl Into<String>, vm_name: impl Into<String>) -> Self {
        Self {
            vm,
            project: project.into(),
            vm_name: vm_name.into(),
            next_context_id: 1,
            contexts: HashMap::new(),
            root_contexts: HashMap::new(),
            timer_period: HashMap::new(),
            pending_done: BTreeSet::new(),
            pending_delete: BTreeSet::new(),
        }
    }

    pub fn runtime(&self) -> Runtime {
        self.vm.runtime()
    }

    pub fn vm(&self) -> &dyn WasmVm {
        self.vm.as_ref()
    }

    pub fn vm_mut(&mut self) -> &mut dyn WasmVm {
        self.vm.as_mut()
    }

    pub fn load(&mut self, code: &[u8]) -> Result<(), EngineError> {
        self.vm.load(code)
    }

    /// Instantiate the module and register the VM context (id 0)
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        self.vm.initialize()?;
        self.contexts
            .insert(0, Arc::new(Context::vm(&self.project, &self.vm_name)));
        Ok(())
    }

    /// Next unused non-zero context id
    pub fn alloc_context_id(&mut self) -> u32 {
        loop {
            let id = self.next_context_id;
            self.next_context_id = self.next_context_id.wrapping_add(1);
            if id != 0 && !self.contexts.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn context(&self, id: u32) -> Option<Arc<Context>> {
        self.contexts.get(&id).cloned()
    }

    pub fn parent_context(&self, id: u32) -> Option<Arc<Context>> {
        let ctx = self.contexts.get(&id)?;
        self.context(ctx.parent_id())
    }

    /// Walk parents up to the self-parented context
    ///
    /// Returns `None` for unknown ids, dangling parents or a cycle.
    pub fn root_context(&self, id: u32) -> Option<Arc<Context>> {
        let mut current = self.contexts.get(&id)?;
        for _ in 0..=self.contexts.len() {
            if current.is_root() {
                return Some(Arc::clone(current));
            }
            current = self.contexts.get(&current.parent_id())?;
        }
        tracing::error!(context = id, "Context parent chain does not terminate");
        None
    }

    pub fn root_context_for(&self, plugin: &PluginDescriptor) -> Option<Arc<Context>> {
        self.root_contexts
            .get(&plugin.key())
            .and_then(|id| self.context(*id))
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn stream_count(&self) -> usize {
        self.contexts.values().filter(|c| c.is_stream()).count()
    }

    /// Start (or restart) the root context of `plugin`
    ///
    /// An existing root for the same plugin key gets its start hook again
    /// and is returned as is.
    pub fn start(
        &mut self,
        plugin: &Arc<PluginDescriptor>,
        host_functions: Arc<dyn HostFunctions>,
        host_token: Option<HostToken>,
    ) -> Result<(Arc<Context>, bool), EngineError> {
        if let Some(existing) = self.root_context_for(plugin) {
            let started = self.on_start(&existing)?;
            return Ok((existing, started));
        }

        let id = self.alloc_context_id();
        let root = Arc::new(Context::root(
            id,
            Arc::clone(plugin),
            host_functions,
            host_token,
        ));
        self.contexts.insert(id, Arc::clone(&root));
        self.root_contexts.insert(plugin.key(), id);

        let started = self.on_start(&root)?;
        Ok((root, started))
    }

    fn on_start(&mut self, root: &Arc<Context>) -> Result<bool, EngineError> {
        let configuration_size = root
            .plugin()
            .map_or(0, |p| p.vm_configuration.len() as u32);
        self.invoke(
            root,
            Hook::ContextCreate {
                context_id: root.id(),
                parent_id: 0,
            },
        )?;
        let started = self.invoke(
            root,
            Hook::VmStart {
                root_id: root.id(),
                configuration_size,
            },
        )?;
        Ok(started.map_or(true, |v| v != 0))
    }

    pub fn configure(&mut self, root: &Arc<Context>) -> Result<bool, EngineError> {
        let configuration_size = root
            .plugin()
            .map_or(0, |p| p.configuration.len() as u32);
        let configured = self.invoke(
            root,
            Hook::Configure {
                root_id: root.id(),
                configuration_size,
            },
        )?;
        Ok(configured.map_or(true, |v| v != 0))
    }

    /// Create a child of `parent` and run the plugin's create hook
    pub fn create_context(
        &mut self,
        parent: &Arc<Context>,
        host_token: Option<HostToken>,
    ) -> Result<Arc<Context>, EngineError> {
        let id = self.alloc_context_id();
        let ctx = Arc::new(Context::derived(id, parent, host_token));
        self.contexts.insert(id, Arc::clone(&ctx));

        let created = self.invoke(
            &ctx,
            Hook::ContextCreate {
                context_id: id,
                parent_id: parent.id(),
            },
        );
        if let Err(e) = created {
            self.contexts.remove(&id);
            return Err(e);
        }
        Ok(ctx)
    }

    pub fn on_request_headers(
        &mut self,
        ctx: &Arc<Context>,
        num_headers: u32,
        end_of_stream: bool,
    ) -> Result<FilterHeadersStatus, EngineError> {
        let status = self.invoke(
            ctx,
            Hook::RequestHeaders {
                context_id: ctx.id(),
                num_headers,
                end_of_stream,
            },
        )?;
        Ok(status.map_or(FilterHeadersStatus::Continue, FilterHeadersStatus::from_code))
    }

    pub fn on_response_headers(
        &mut self,
        ctx: &Arc<Context>,
        num_headers: u32,
        end_of_stream: bool,
    ) -> Result<FilterHeadersStatus, EngineError> {
        let status = self.invoke(
            ctx,
            Hook::ResponseHeaders {
                context_id: ctx.id(),
                num_headers,
                end_of_stream,
            },
        )?;
        Ok(status.map_or(FilterHeadersStatus::Continue, FilterHeadersStatus::from_code))
    }

    /// `true` when the context is done and may be deleted
    pub fn on_done(&mut self, ctx: &Arc<Context>) -> Result<bool, EngineError> {
        let done = self.invoke(
            ctx,
            Hook::Done {
                context_id: ctx.id(),
            },
        )?;
        Ok(done.map_or(true, |v| v != 0))
    }

    /// Run the log hook; header maps of the context become read-only
    pub fn on_log(&mut self, ctx: &Arc<Context>) -> Result<(), EngineError> {
        ctx.enter_log_phase();
        self.invoke(
            ctx,
            Hook::Log {
                context_id: ctx.id(),
            },
        )?;
        Ok(())
    }

    pub fn on_delete(&mut self, ctx: &Arc<Context>) -> Result<(), EngineError> {
        self.invoke(
            ctx,
            Hook::Delete {
                context_id: ctx.id(),
            },
        )?;
        Ok(())
    }

    /// Drop a context from the arena
    pub fn remove_context(&mut self, id: u32) -> Option<Arc<Context>> {
        let ctx = self.contexts.remove(&id)?;
        if ctx.kind() == crate::context::ContextKind::Root {
            self.root_contexts.retain(|_, root| *root != id);
            self.timer_period.remove(&id);
        }
        self.pending_done.remove(&id);
        self.pending_delete.remove(&id);
        Some(ctx)
    }

    pub fn set_timer_period(&mut self, root_id: u32, period: Duration) {
        if period.is_zero() {
            self.timer_period.remove(&root_id);
        } else {
            self.timer_period.insert(root_id, period);
        }
    }

    pub fn exists_timer_period(&self, root_id: u32) -> bool {
        self.timer_period.contains_key(&root_id)
    }

    pub fn get_timer_period(&self, root_id: u32) -> Option<Duration> {
        self.timer_period.get(&root_id).copied()
    }

    pub fn remove_timer_period(&mut self, root_id: u32) -> Option<Duration> {
        self.timer_period.remove(&root_id)
    }

    /// Every context is a root and no timer is registered
    pub fn ready_shutdown(&self) -> bool {
        self.contexts.values().all(|c| c.is_root()) && self.timer_period.is_empty()
    }

    /// No root contexts remain and nothing is pending
    pub fn ready_delete(&self) -> bool {
        self.root_contexts.is_empty() && self.pending_done.is_empty() && self.pending_delete.is_empty()
    }

    /// Ask every root context to finish
    ///
    /// Roots that answer done are deleted right away; the others wait in
    /// the pending-done set for [`WasmInstance::done`]. Returns
    /// `ready_delete()`.
    pub fn shutdown(&mut self) -> Result<bool, EngineError> {
        let mut roots: Vec<u32> = self.root_contexts.values().copied().collect();
        roots.sort_unstable();
        for id in roots {
            let Some(root) = self.context(id) else {
                continue;
            };
            self.timer_period.remove(&id);
            if self.on_done(&root)? {
                self.delete_root(&root)?;
            } else {
                self.pending_done.insert(id);
            }
        }
        Ok(self.ready_delete())
    }

    /// Complete a root that deferred its shutdown; `false` if it was not pending
    pub fn done(&mut self, root_id: u32) -> Result<bool, EngineError> {
        if !self.pending_done.remove(&root_id) {
            return Ok(false);
        }
        let Some(root) = self.context(root_id) else {
            return Ok(false);
        };
        self.delete_root(&root)?;
        Ok(true)
    }

    /// A root whose delete hook fails stays in the arena and pending
    fn delete_root(&mut self, root: &Arc<Context>) -> Result<(), EngineError> {
        let id = root.id();
        self.pending_delete.insert(id);
        self.on_delete(root)?;
        self.remove_context(id);
        Ok(())
    }

    fn invoke(&mut self, ctx: &Arc<Context>, hook: Hook) -> Result<Option<u32>, EngineError> {
        let host: Arc<dyn PluginHost> = ctx.clone();
        self.vm.call(host, hook)
    }
}
