//! VM registry
//!
//! Process-wide table of launched VMs keyed by `project:vm_name`. A second
//! launch of a known key returns the existing entry. The table lock is
//! never held while an engine runs.

use crate::config::{vm_key, VmConfig};
use crate::context::Context;
use crate::engine::EngineFactory;
use crate::host::HostToken;
use crate::runtime::{LaunchError, LaunchedVm, PluginDescriptor, RuntimeSelector};
use crate::wasm::WasmInstance;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use wasm_bridge_api::Runtime;

static GLOBAL: OnceLock<VmRegistry> = OnceLock::new();

/// Thread-safe registry of launched VMs
#[derive(Clone)]
pub struct VmRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    vms: Mutex<HashMap<String, Arc<VmEntry>>>,
    selector: RwLock<RuntimeSelector>,
}

/// One launched VM
pub struct VmEntry {
    project: String,
    name: String,
    created_at: DateTime<Utc>,
    runtime: Runtime,
    plugin: Arc<PluginDescriptor>,
    root_context: Arc<Context>,
    wasm: Mutex<WasmInstance>,
    registry: Weak<RegistryInner>,
}

/// Listing row of a registered VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmInfo {
    pub project: String,
    pub name: String,
    pub runtime: Runtime,
    pub created_at: DateTime<Utc>,
    pub root_context_id: u32,
}

impl VmRegistry {
    /// The process-wide registry, built on first use
    pub fn global() -> &'static VmRegistry {
        GLOBAL.get_or_init(|| Self::with_selector(RuntimeSelector::default()))
    }

    pub(crate) fn with_selector(selector: RuntimeSelector) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                vms: Mutex::new(HashMap::new()),
                selector: RwLock::new(selector),
            }),
        }
    }

    /// Make another engine available to later launches
    pub fn install_engine(&self, runtime: Runtime, factory: Arc<dyn EngineFactory>) {
        self.inner
            .selector
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .install(runtime, factory);
        tracing::info!(runtime = %runtime, "Engine installed");
    }

    pub fn supports(&self, runtime: Runtime) -> bool {
        self.selector().supports(runtime)
    }

    /// Return the VM registered for the config's key, launching it first if needed
    pub fn launch(
        &self,
        config: &VmConfig,
        host_token: Option<HostToken>,
    ) -> Result<Arc<VmEntry>, LaunchError> {
        let key = config.key();
        if let Some(entry) = self.vms().get(&key) {
            tracing::debug!(vm = %key, "VM already launched");
            return Ok(Arc::clone(entry));
        }

        let selector = self.selector();
        let launched = selector.build(config, host_token).map_err(|e| {
            tracing::warn!(vm = %key, error = %e, "VM launch failed");
            e
        })?;
        let entry = Arc::new(VmEntry::new(
            &config.project_name,
            &config.vm_name,
            launched,
            Arc::downgrade(&self.inner),
        ));

        let mut vms = self.vms();
        let registered = Arc::clone(vms.entry(key.clone()).or_insert(entry));
        tracing::info!(vm = %key, runtime = %registered.runtime, "VM registered");
        Ok(registered)
    }

    pub fn get(&self, project: &str, vm_name: &str) -> Option<Arc<VmEntry>> {
        self.vms().get(&vm_key(project, vm_name)).cloned()
    }

    /// Every entry, ordered by key
    pub fn list(&self) -> Vec<Arc<VmEntry>> {
        let mut entries: Vec<Arc<VmEntry>> = self.vms().values().cloned().collect();
        entries.sort_by_key(|e| e.key());
        entries
    }

    /// Entries named `vm_name`, or every entry when `vm_name` is empty
    ///
    /// `project` is accepted for call compatibility and does not narrow the
    /// result; use [`VmRegistry::find`] to match on both.
    pub fn filter(&self, _project: &str, vm_name: &str) -> Vec<Arc<VmEntry>> {
        self.list()
            .into_iter()
            .filter(|e| vm_name.is_empty() || e.name == vm_name)
            .collect()
    }

    /// Entries matching both arguments; an empty argument matches anything
    pub fn find(&self, project: &str, vm_name: &str) -> Vec<Arc<VmEntry>> {
        self.list()
            .into_iter()
            .filter(|e| project.is_empty() || e.project == project)
            .filter(|e| vm_name.is_empty() || e.name == vm_name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vms().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms().is_empty()
    }

    pub fn infos(&self) -> Vec<VmInfo> {
        self.list().iter().map(|e| e.info()).collect()
    }

    /// Listing as a JSON array
    pub fn list_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.infos())
    }

    fn vms(&self) -> MutexGuard<'_, HashMap<String, Arc<VmEntry>>> {
        self.inner.vms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn selector(&self) -> RuntimeSelector {
        self.inner
            .selector
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for VmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmRegistry")
            .field("vms", &self.list().iter().map(|e| e.key()).collect::<Vec<_>>())
            .finish()
    }
}

impl VmEntry {
    fn new(project: &str, name: &str, launched: LaunchedVm, registry: Weak<RegistryInner>) -> Self {
        Self {
            project: project.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            runtime: launched.runtime,
            plugin: launched.plugin,
            root_context: launched.root_context,
            wasm: Mutex::new(launched.wasm),
            registry,
        }
    }

    pub fn key(&self) -> String {
        vm_key(&self.project, &self.name)
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    pub fn plugin(&self) -> &Arc<PluginDescriptor> {
        &self.plugin
    }

    pub fn root_context(&self) -> &Arc<Context> {
        &self.root_context
    }

    /// Exclusive access to the engine instance
    pub fn wasm(&self) -> MutexGuard<'_, WasmInstance> {
        self.wasm.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ready_shutdown(&self) -> bool {
        self.wasm().ready_shutdown()
    }

    pub fn ready_delete(&self) -> bool {
        self.wasm().ready_delete()
    }

    /// Registry holding this entry, while it is alive
    pub fn registry(&self) -> Option<VmRegistry> {
        self.registry.upgrade().map(|inner| VmRegistry { inner })
    }

    pub fn info(&self) -> VmInfo {
        VmInfo {
            project: self.project.clone(),
            name: self.name.clone(),
            runtime: self.runtime,
            created_at: self.created_at,
            root_context_id: self.root_context.id(),
        }
    }
}

impl fmt::Debug for VmEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmEntry")
            .field("project", &self.project)
            .field("name", &self.name)
            .field("runtime", &self.runtime)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WasmtimeVm;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(project: &str, name: &str) -> VmConfig {
        VmConfig::new(project, name)
            .runtime(Runtime::Wasmtime)
            .data("(module)")
    }

    fn counting_registry() -> (VmRegistry, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let selector = RuntimeSelector::empty().with_engine(Runtime::Wasmtime, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            WasmtimeVm::boxed()
        });
        (VmRegistry::with_selector(selector), count)
    }

    #[test]
    fn test_launch_deduplicates() {
        let (registry, count) = counting_registry();
        let first = registry.launch(&config("p1", "v1"), None).unwrap();
        let second = registry.launch(&config("p1", "v1"), None).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(first.key(), "p1:v1");
    }

    #[test]
    fn test_filter_ignores_project() {
        let (registry, _) = counting_registry();
        registry.launch(&config("p1", "v1"), None).unwrap();
        registry.launch(&config("p1", "v2"), None).unwrap();
        registry.launch(&config("p2", "v1"), None).unwrap();

        assert_eq!(registry.filter("p1", "").len(), 3);
        let named = registry.filter("p1", "v1");
        assert_eq!(named.len(), 2);
        assert!(named.iter().all(|e| e.name() == "v1"));
        assert!(registry.filter("", "v3").is_empty());
    }

    #[test]
    fn test_find_matches_project() {
        let (registry, _) = counting_registry();
        registry.launch(&config("p1", "v1"), None).unwrap();
        registry.launch(&config("p2", "v1"), None).unwrap();

        let found = registry.find("p2", "v1");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].project(), "p2");
        assert_eq!(registry.find("p1", "").len(), 1);
        assert_eq!(registry.find("", "").len(), 2);
    }

    #[test]
    fn test_failed_launch_leaves_no_entry() {
        let (registry, count) = counting_registry();
        let bad = VmConfig::new("p1", "broken")
            .runtime(Runtime::Wasmtime)
            .data("this is not wasm");
        assert!(matches!(
            registry.launch(&bad, None),
            Err(LaunchError::Load(_))
        ));
        assert!(registry.is_empty());
        assert!(registry.get("p1", "broken").is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_install_engine() {
        let (registry, _) = counting_registry();
        assert!(!registry.supports(Runtime::WasmEdge));
        let err = registry
            .launch(&config("p1", "edge").runtime(Runtime::WasmEdge), None)
            .unwrap_err();
        assert!(matches!(err, LaunchError::RuntimeUnavailable(Runtime::WasmEdge)));

        registry.install_engine(Runtime::WasmEdge, Arc::new(WasmtimeVm::boxed));
        let entry = registry
            .launch(&config("p1", "edge").runtime(Runtime::WasmEdge), None)
            .unwrap();
        assert_eq!(entry.runtime(), Runtime::WasmEdge);
    }

    #[test]
    fn test_entry_back_reference_and_listing() {
        let (registry, _) = counting_registry();
        let entry = registry.launch(&config("p1", "v1"), None).unwrap();
        let back = entry.registry().unwrap();
        assert_eq!(back.len(), 1);

        let infos = registry.infos();
        assert_eq!(infos[0].project, "p1");
        assert_eq!(infos[0].root_context_id, entry.root_context().id());

        let json: serde_json::Value = serde_json::from_str(&registry.list_json().unwrap()).unwrap();
        assert_eq!(json[0]["name"], "v1");
        assert_eq!(json[0]["runtime"], "wasmtime");

        drop(registry);
        drop(back);
        assert!(entry.registry().is_none());
    }

    #[test]
    fn test_concurrent_launches_share_entry() {
        let (registry, _) = counting_registry();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.launch(&config("p1", "race"), None).unwrap())
            })
            .collect();
        let entries: Vec<Arc<VmEntry>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        assert_eq!(registry.len(), 1);
    }
}
