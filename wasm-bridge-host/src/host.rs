//! Host function indirection
//!
//! The embedding application reaches plugins through the bridge, and plugins
//! reach back into the application through [`HostFunctions`]. Every method
//! has a default body answering [`HostError::Unimplemented`], so a host only
//! implements the capabilities it actually wires.
//!
//! [`HostFunctionTable`] is a ready-made implementation built from up to
//! eight closures, one per slot; an empty slot keeps the default answer.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use wasm_bridge_api::{HeaderMapType, HostError, HostResult, KvList, LogLevel};

/// Opaque correlation token supplied by the host for a VM or a stream
pub type HostToken = Arc<dyn Any + Send + Sync>;

/// Identifies the context on whose behalf a host function is called
#[derive(Debug, Clone, Copy)]
pub struct HostCall<'a> {
    pub project: &'a str,
    pub vm_name: &'a str,
    pub context_id: u32,
    /// `true` for stream contexts, `false` for VM-level (root) contexts
    pub is_stream: bool,
    pub token: Option<&'a HostToken>,
}

impl<'a> HostCall<'a> {
    /// Downcast the host token to a concrete type
    pub fn token_as<T: Any>(&self) -> Option<&'a T> {
        self.token.and_then(|t| t.as_ref().downcast_ref::<T>())
    }
}

/// Capabilities the embedding application exposes to plugins
pub trait HostFunctions: Send + Sync {
    fn log(&self, call: &HostCall<'_>, level: LogLevel, message: &str) -> HostResult<()> {
        let _ = (call, level, message);
        Err(HostError::Unimplemented)
    }

    /// Resolve a property path; path segments are separated by `\0`
    fn get_property(&self, call: &HostCall<'_>, path: &str) -> HostResult<String> {
        let _ = (call, path);
        Err(HostError::Unimplemented)
    }

    /// Report an internal error of a context
    fn error(&self, call: &HostCall<'_>, message: &str) -> HostResult<()> {
        let _ = (call, message);
        Err(HostError::Unimplemented)
    }

    fn add_header_map_value(
        &self,
        call: &HostCall<'_>,
        map: HeaderMapType,
        key: &str,
        value: &str,
    ) -> HostResult<()> {
        let _ = (call, map, key, value);
        Err(HostError::Unimplemented)
    }

    fn get_header_map_value(
        &self,
        call: &HostCall<'_>,
        map: HeaderMapType,
        key: &str,
    ) -> HostResult<String> {
        let _ = (call, map, key);
        Err(HostError::Unimplemented)
    }

    /// Return every pair of a map as a linked list; the bridge consumes it
    fn get_header_map_pairs(&self, call: &HostCall<'_>, map: HeaderMapType) -> HostResult<KvList> {
        let _ = (call, map);
        Err(HostError::Unimplemented)
    }

    /// Wall clock in nanoseconds since the Unix epoch
    fn current_time_nanos(&self) -> HostResult<u64> {
        Err(HostError::Unimplemented)
    }

    fn monotonic_time_nanos(&self) -> HostResult<u64> {
        Err(HostError::Unimplemented)
    }
}

/// Host that provides nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHostFunctions;

impl HostFunctions for NoHostFunctions {}

type LogFn = dyn Fn(&HostCall<'_>, LogLevel, &str) -> HostResult<()> + Send + Sync;
type PropertyFn = dyn Fn(&HostCall<'_>, &str) -> HostResult<String> + Send + Sync;
type ErrorFn = dyn Fn(&HostCall<'_>, &str) -> HostResult<()> + Send + Sync;
type AddHeaderFn = dyn Fn(&HostCall<'_>, HeaderMapType, &str, &str) -> HostResult<()> + Send + Sync;
type GetHeaderFn = dyn Fn(&HostCall<'_>, HeaderMapType, &str) -> HostResult<String> + Send + Sync;
type PairsFn = dyn Fn(&HostCall<'_>, HeaderMapType) -> HostResult<KvList> + Send + Sync;
type ClockFn = dyn Fn() -> u64 + Send + Sync;

/// Host functions assembled from optional closures
///
/// ```rust,ignore
/// let host = HostFunctionTable::new()
///     .with_log(|call, level, msg| {
///         println!("[{}:{}] {:?} {}", call.project, call.vm_name, level, msg);
///         Ok(())
///     })
///     .with_system_clocks();
/// ```
#[derive(Clone, Default)]
pub struct HostFunctionTable {
    log: Option<Arc<LogFn>>,
    get_property: Option<Arc<PropertyFn>>,
    error: Option<Arc<ErrorFn>>,
    add_header_map_value: Option<Arc<AddHeaderFn>>,
    get_header_map_value: Option<Arc<GetHeaderFn>>,
    get_header_map_pairs: Option<Arc<PairsFn>>,
    current_time: Option<Arc<ClockFn>>,
    monotonic_time: Option<Arc<ClockFn>>,
}

impl HostFunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(
        mut self,
        f: impl Fn(&HostCall<'_>, LogLevel, &str) -> HostResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.log = Some(Arc::new(f));
        self
    }

    pub fn with_get_property(
        mut self,
        f: impl Fn(&HostCall<'_>, &str) -> HostResult<String> + Send + Sync + 'static,
    ) -> Self {
        self.get_property = Some(Arc::new(f));
        self
    }

    pub fn with_error(
        mut self,
        f: impl Fn(&HostCall<'_>, &str) -> HostResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn with_add_header_map_value(
        mut self,
        f: impl Fn(&HostCall<'_>, HeaderMapType, &str, &str) -> HostResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.add_header_map_value = Some(Arc::new(f));
        self
    }

    pub fn with_get_header_map_value(
        mut self,
        f: impl Fn(&HostCall<'_>, HeaderMapType, &str) -> HostResult<String> + Send + Sync + 'static,
    ) -> Self {
        self.get_header_map_value = Some(Arc::new(f));
        self
    }

    pub fn with_get_header_map_pairs(
        mut self,
        f: impl Fn(&HostCall<'_>, HeaderMapType) -> HostResult<KvList> + Send + Sync + 'static,
    ) -> Self {
        self.get_header_map_pairs = Some(Arc::new(f));
        self
    }

    pub fn with_current_time(mut self, f: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.current_time = Some(Arc::new(f));
        self
    }

    pub fn with_monotonic_time(mut self, f: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.monotonic_time = Some(Arc::new(f));
        self
    }

    /// Fill both clock slots from the operating system clocks
    pub fn with_system_clocks(self) -> Self {
        self.with_current_time(system_time_nanos)
            .with_monotonic_time(monotonic_time_nanos)
    }

    /// Names of the slots that are populated
    pub fn populated_slots(&self) -> Vec<&'static str> {
        [
            ("log", self.log.is_some()),
            ("get_property", self.get_property.is_some()),
            ("error", self.error.is_some()),
            ("add_header_map_value", self.add_header_map_value.is_some()),
            ("get_header_map_value", self.get_header_map_value.is_some()),
            ("get_header_map_pairs", self.get_header_map_pairs.is_some()),
            ("current_time", self.current_time.is_some()),
            ("monotonic_time", self.monotonic_time.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }
}

impl fmt::Debug for HostFunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunctionTable")
            .field("slots", &self.populated_slots())
            .finish()
    }
}

impl HostFunctions for HostFunctionTable {
    fn log(&self, call: &HostCall<'_>, level: LogLevel, message: &str) -> HostResult<()> {
        match &self.log {
            Some(f) => f(call, level, message),
            None => Err(HostError::Unimplemented),
        }
    }

    fn get_property(&self, call: &HostCall<'_>, path: &str) -> HostResult<String> {
        match &self.get_property {
            Some(f) => f(call, path),
            None => Err(HostError::Unimplemented),
        }
    }

    fn error(&self, call: &HostCall<'_>, message: &str) -> HostResult<()> {
        match &self.error {
            Some(f) => f(call, message),
            None => Err(HostError::Unimplemented),
        }
    }

    fn add_header_map_value(
        &self,
        call: &HostCall<'_>,
        map: HeaderMapType,
        key: &str,
        value: &str,
    ) -> HostResult<()> {
        match &self.add_header_map_value {
            Some(f) => f(call, map, key, value),
            None => Err(HostError::Unimplemented),
        }
    }

    fn get_header_map_value(
        &self,
        call: &HostCall<'_>,
        map: HeaderMapType,
        key: &str,
    ) -> HostResult<String> {
        match &self.get_header_map_value {
            Some(f) => f(call, map, key),
            None => Err(HostError::Unimplemented),
        }
    }

    fn get_header_map_pairs(&self, call: &HostCall<'_>, map: HeaderMapType) -> HostResult<KvList> {
        match &self.get_header_map_pairs {
            Some(f) => f(call, map),
            None => Err(HostError::Unimplemented),
        }
    }

    fn current_time_nanos(&self) -> HostResult<u64> {
        self.current_time
            .as_ref()
            .map(|f| f())
            .ok_or(HostError::Unimplemented)
    }

    fn monotonic_time_nanos(&self) -> HostResult<u64> {
        self.monotonic_time
            .as_ref()
            .map(|f| f())
            .ok_or(HostError::Unimplemented)
    }
}

/// VM-level hooks of the embedding application
///
/// Used by the engine integration adapter; every hook is optional.
pub trait VmIntegration: Send + Sync {
    fn trace(&self, message: &str) {
        let _ = message;
    }

    fn error(&self, message: &str) {
        let _ = message;
    }

    /// Current log level as configured by the host, if it keeps one
    fn get_log_level(&self) -> Option<LogLevel> {
        None
    }

    fn set_log_level(&self, level: LogLevel) {
        let _ = level;
    }
}

/// Integration with no hooks
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIntegration;

impl VmIntegration for NoIntegration {}

/// Wall clock in nanoseconds since the Unix epoch, 0 if the clock is unreadable
pub fn system_time_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Monotonic clock in nanoseconds, 0 if the clock is unreadable
#[cfg(unix)]
pub fn monotonic_time_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// Monotonic clock in nanoseconds since the first read in this process
#[cfg(not(unix))]
pub fn monotonic_time_nanos() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static BASE: OnceLock<Instant> = OnceLock::new();
    let nanos = BASE.get_or_init(Instant::now).elapsed().as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn call() -> HostCall<'static> {
        HostCall {
            project: "p1",
            vm_name: "v1",
            context_id: 1,
            is_stream: false,
            token: None,
        }
    }

    #[test]
    fn test_empty_table_is_unimplemented() {
        let table = HostFunctionTable::new();
        assert_eq!(
            table.log(&call(), LogLevel::Info, "hi"),
            Err(HostError::Unimplemented)
        );
        assert_eq!(
            table.get_property(&call(), "plugin_root_id"),
            Err(HostError::Unimplemented)
        );
        assert_eq!(table.current_time_nanos(), Err(HostError::Unimplemented));
        assert!(table.populated_slots().is_empty());
    }

    #[test]
    fn test_table_dispatches_to_slots() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let table = HostFunctionTable::new()
            .with_log(move |call, level, msg| {
                sink.lock()
                    .unwrap()
                    .push(format!("{}:{}:{:?}:{}", call.project, call.vm_name, level, msg));
                Ok(())
            })
            .with_current_time(|| 42);

        table.log(&call(), LogLevel::Warn, "careful").unwrap();
        assert_eq!(seen.lock().unwrap()[0], "p1:v1:Warn:careful");
        assert_eq!(table.current_time_nanos(), Ok(42));
        assert_eq!(table.populated_slots(), vec!["log", "current_time"]);
    }

    #[test]
    fn test_token_downcast() {
        let token: HostToken = Arc::new(7u32);
        let call = HostCall {
            token: Some(&token),
            ..call()
        };
        assert_eq!(call.token_as::<u32>(), Some(&7));
        assert_eq!(call.token_as::<String>(), None);
    }

    #[test]
    fn test_system_clocks_are_nonzero() {
        assert!(system_time_nanos() > 0);
        let a = monotonic_time_nanos();
        let b = monotonic_time_nanos();
        assert!(a > 0);
        assert!(b >= a);
    }
}
