//! Wasmtime engine
//!
//! Runs plugins built against the proxy-wasm 0.2.1 ABI. Only the host calls
//! the bridge serves are linked; every other import traps when called.

use super::{EngineError, Hook, PluginHost, WasmVm};
use crate::headers::encode_pairs;
use crate::integration::IntegrationAdapter;
use std::sync::Arc;
use wasm_bridge_api::{HeaderMapType, HostError, HostResult, LogLevel, Runtime, WasmResult};
use wasmtime::{Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, Store, TypedFunc, Val};

const ABI_MODULE: &str = "env";
const WASI_MODULE: &str = "wasi_snapshot_preview1";

const WASI_ERRNO_SUCCESS: i32 = 0;
const WASI_ERRNO_FAULT: i32 = 21;
const WASI_ERRNO_INVAL: i32 = 28;
const WASI_ERRNO_NOTSUP: i32 = 58;

#[derive(Default)]
struct VmState {
    /// Context the current hook runs for; only set during `call`
    host: Option<Arc<dyn PluginHost>>,
    integration: Option<Arc<IntegrationAdapter>>,
}

/// Engine backed by wasmtime
pub struct WasmtimeVm {
    engine: Engine,
    store: Store<VmState>,
    module: Option<Module>,
    instance: Option<Instance>,
}

impl WasmtimeVm {
    pub fn new() -> Result<Self, EngineError> {
        let mut config = Config::new();
        config.wasm_memory64(false);
        config.max_wasm_stack(512 * 1024);

        let engine = Engine::new(&config).map_err(EngineError::EngineCreation)?;
        let store = Store::new(&engine, VmState::default());

        Ok(Self {
            engine,
            store,
            module: None,
            instance: None,
        })
    }

    /// Factory function for the runtime selector
    pub fn boxed() -> Result<Box<dyn WasmVm>, EngineError> {
        Ok(Box::new(Self::new()?))
    }
}

impl WasmVm for WasmtimeVm {
    fn runtime(&self) -> Runtime {
        Runtime::Wasmtime
    }

    fn set_integration(&mut self, integration: Arc<IntegrationAdapter>) {
        self.store.data_mut().integration = Some(integration);
    }

    fn integration(&self) -> Option<&Arc<IntegrationAdapter>> {
        self.store.data().integration.as_ref()
    }

    fn load(&mut self, code: &[u8]) -> Result<(), EngineError> {
        let module = Module::new(&self.engine, code).map_err(EngineError::ModuleCompilation)?;
        self.module = Some(module);
        self.instance = None;
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), EngineError> {
        let module = self.module.as_ref().ok_or(EngineError::NotLoaded)?;

        // 1. Link host ABI, trap on anything else
        let mut linker = Linker::new(&self.engine);
        link_host_abi(&mut linker).map_err(EngineError::Instantiation)?;
        linker
            .define_unknown_imports_as_traps(module)
            .map_err(EngineError::Instantiation)?;

        // 2. Instantiate
        let instance = linker
            .instantiate(&mut self.store, module)
            .map_err(EngineError::Instantiation)?;

        // 3. Run the reactor (or command) initializer if exported
        for name in ["_initialize", "_start"] {
            if let Some(func) = instance.get_func(&mut self.store, name) {
                func.call(&mut self.store, &[], &mut [])
                    .map_err(|source| EngineError::FunctionCall {
                        function: name,
                        source,
                    })?;
                break;
            }
        }

        self.instance = Some(instance);
        Ok(())
    }

    fn call(&mut self, host: Arc<dyn PluginHost>, hook: Hook) -> Result<Option<u32>, EngineError> {
        let instance = self.instance.ok_or(EngineError::NotInitialized)?;
        let name = hook.export_name();
        let Some(func) = instance.get_func(&mut self.store, name) else {
            return Ok(None);
        };

        if let Some(integration) = &self.store.data().integration {
            integration.trace(&format!("{} context {}", name, hook.context_id()));
        }

        let params: Vec<Val> = hook.args().into_iter().map(|a| Val::I32(a as i32)).collect();
        let mut results = vec![Val::I32(0); func.ty(&self.store).results().len()];

        self.store.data_mut().host = Some(host);
        let outcome = func.call(&mut self.store, &params, &mut results);
        self.store.data_mut().host = None;

        outcome.map_err(|source| {
            if let Some(integration) = &self.store.data().integration {
                integration.error(&format!("{} failed: {}", name, source));
            }
            EngineError::FunctionCall {
                function: name,
                source,
            }
        })?;

        Ok(Some(results.first().and_then(Val::i32).map_or(0, |v| v as u32)))
    }
}

fn status(result: HostResult<()>) -> i32 {
    WasmResult::from_result(&result).code() as i32
}

fn link_host_abi(linker: &mut Linker<VmState>) -> anyhow::Result<()> {
    linker.func_wrap(
        ABI_MODULE,
        "proxy_log",
        |mut caller: Caller<'_, VmState>, level: i32, ptr: i32, len: i32| -> i32 {
            status(proxy_log(&mut caller, level, ptr, len))
        },
    )?;
    linker.func_wrap(
        ABI_MODULE,
        "proxy_get_log_level",
        |mut caller: Caller<'_, VmState>, ret: i32| -> i32 {
            let level = caller
                .data()
                .integration
                .as_ref()
                .map(|i| i.log_level())
                .unwrap_or_default();
            status(write_u32(&mut caller, ret, level.abi_code()))
        },
    )?;
    linker.func_wrap(
        ABI_MODULE,
        "proxy_get_property",
        |mut caller: Caller<'_, VmState>,
         path_ptr: i32,
         path_len: i32,
         ret_ptr: i32,
         ret_size: i32|
         -> i32 {
            status(proxy_get_property(
                &mut caller,
                path_ptr,
                path_len,
                ret_ptr,
                ret_size,
            ))
        },
    )?;
    linker.func_wrap(
        ABI_MODULE,
        "proxy_get_header_map_value",
        |mut caller: Caller<'_, VmState>,
         map: i32,
         key_ptr: i32,
         key_len: i32,
         ret_ptr: i32,
         ret_size: i32|
         -> i32 {
            status(proxy_get_header_map_value(
                &mut caller,
                map,
                key_ptr,
                key_len,
                ret_ptr,
                ret_size,
            ))
        },
    )?;
    linker.func_wrap(
        ABI_MODULE,
        "proxy_add_header_map_value",
        |mut caller: Caller<'_, VmState>,
         map: i32,
         key_ptr: i32,
         key_len: i32,
         value_ptr: i32,
         value_len: i32|
         -> i32 {
            status(proxy_add_header_map_value(
                &mut caller,
                map,
                key_ptr,
                key_len,
                value_ptr,
                value_len,
            ))
        },
    )?;
    linker.func_wrap(
        ABI_MODULE,
        "proxy_get_header_map_pairs",
        |mut caller: Caller<'_, VmState>, map: i32, ret_ptr: i32, ret_size: i32| -> i32 {
            status(proxy_get_header_map_pairs(&mut caller, map, ret_ptr, ret_size))
        },
    )?;
    linker.func_wrap(
        ABI_MODULE,
        "proxy_get_current_time_nanoseconds",
        |mut caller: Caller<'_, VmState>, ret: i32| -> i32 {
            let result = current_host(&caller).and_then(|host| {
                let now = host.current_time_nanos();
                write_u64(&mut caller, ret, now)
            });
            status(result)
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "clock_time_get",
        |mut caller: Caller<'_, VmState>, clock_id: i32, _precision: i64, ret: i32| -> i32 {
            clock_time_get(&mut caller, clock_id, ret)
        },
    )?;
    Ok(())
}

fn proxy_log(caller: &mut Caller<'_, VmState>, level: i32, ptr: i32, len: i32) -> HostResult<()> {
    let level = LogLevel::from_abi(level as u32).ok_or(HostError::BadArgument)?;
    let message = read_string(caller, ptr, len)?;
    current_host(caller)?.log(level, &message)
}

fn proxy_get_property(
    caller: &mut Caller<'_, VmState>,
    path_ptr: i32,
    path_len: i32,
    ret_ptr: i32,
    ret_size: i32,
) -> HostResult<()> {
    let path = read_string(caller, path_ptr, path_len)?;
    let value = current_host(caller)?.get_property(&path)?;
    copy_to_guest(caller, value.as_bytes(), ret_ptr, ret_size)
}

fn proxy_get_header_map_value(
    caller: &mut Caller<'_, VmState>,
    map: i32,
    key_ptr: i32,
    key_len: i32,
    ret_ptr: i32,
    ret_size: i32,
) -> HostResult<()> {
    let map = header_map(map)?;
    let key = read_string(caller, key_ptr, key_len)?;
    let value = current_host(caller)?.get_header_map_value(map, &key)?;
    copy_to_guest(caller, value.as_bytes(), ret_ptr, ret_size)
}

fn proxy_add_header_map_value(
    caller: &mut Caller<'_, VmState>,
    map: i32,
    key_ptr: i32,
    key_len: i32,
    value_ptr: i32,
    value_len: i32,
) -> HostResult<()> {
    let map = header_map(map)?;
    let key = read_string(caller, key_ptr, key_len)?;
    let value = read_string(caller, value_ptr, value_len)?;
    current_host(caller)?.add_header_map_value(map, &key, &value)
}

fn proxy_get_header_map_pairs(
    caller: &mut Caller<'_, VmState>,
    map: i32,
    ret_ptr: i32,
    ret_size: i32,
) -> HostResult<()> {
    let map = header_map(map)?;
    let pairs = current_host(caller)?.get_header_map_pairs(map)?;
    copy_to_guest(caller, &encode_pairs(&pairs), ret_ptr, ret_size)
}

fn clock_time_get(caller: &mut Caller<'_, VmState>, clock_id: i32, ret: i32) -> i32 {
    let Ok(host) = current_host(caller) else {
        return WASI_ERRNO_NOTSUP;
    };
    let nanos = match clock_id {
        0 => host.current_time_nanos(),
        1 => host.monotonic_time_nanos(),
        _ => return WASI_ERRNO_INVAL,
    };
    if nanos == 0 {
        return WASI_ERRNO_NOTSUP;
    }
    match write_u64(caller, ret, nanos) {
        Ok(()) => WASI_ERRNO_SUCCESS,
        Err(_) => WASI_ERRNO_FAULT,
    }
}

fn header_map(code: i32) -> HostResult<HeaderMapType> {
    HeaderMapType::from_code(code as u32).ok_or(HostError::BadArgument)
}

fn current_host(caller: &Caller<'_, VmState>) -> HostResult<Arc<dyn PluginHost>> {
    caller
        .data()
        .host
        .clone()
        .ok_or(HostError::InternalFailure)
}

fn memory(caller: &mut Caller<'_, VmState>) -> HostResult<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or(HostError::InvalidMemoryAccess)
}

fn read_bytes(caller: &mut Caller<'_, VmState>, ptr: i32, len: i32) -> HostResult<Vec<u8>> {
    let start = ptr as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .ok_or(HostError::InvalidMemoryAccess)?;
    let memory = memory(caller)?;
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or(HostError::InvalidMemoryAccess)
}

fn read_string(caller: &mut Caller<'_, VmState>, ptr: i32, len: i32) -> HostResult<String> {
    String::from_utf8(read_bytes(caller, ptr, len)?).map_err(|_| HostError::BadArgument)
}

fn write_bytes(caller: &mut Caller<'_, VmState>, ptr: i32, bytes: &[u8]) -> HostResult<()> {
    let memory = memory(caller)?;
    memory
        .write(&mut *caller, ptr as u32 as usize, bytes)
        .map_err(|_| HostError::InvalidMemoryAccess)
}

fn write_u32(caller: &mut Caller<'_, VmState>, ptr: i32, value: u32) -> HostResult<()> {
    write_bytes(caller, ptr, &value.to_le_bytes())
}

fn write_u64(caller: &mut Caller<'_, VmState>, ptr: i32, value: u64) -> HostResult<()> {
    write_bytes(caller, ptr, &value.to_le_bytes())
}

fn guest_allocator(caller: &mut Caller<'_, VmState>) -> HostResult<TypedFunc<i32, i32>> {
    for name in ["proxy_on_memory_allocate", "malloc"] {
        if let Some(func) = caller.get_export(name).and_then(Extern::into_func) {
            return func
                .typed::<i32, i32>(&*caller)
                .map_err(|_| HostError::InvalidMemoryAccess);
        }
    }
    Err(HostError::InvalidMemoryAccess)
}

/// Copy a host value into guest memory and report its location
fn copy_to_guest(
    caller: &mut Caller<'_, VmState>,
    bytes: &[u8],
    ret_ptr: i32,
    ret_size: i32,
) -> HostResult<()> {
    let size = i32::try_from(bytes.len()).map_err(|_| HostError::BadArgument)?;
    let alloc = guest_allocator(caller)?;
    let ptr = alloc.call(&mut *caller, size).map_err(|e| {
        tracing::warn!(error = %e, size, "Guest allocation failed");
        HostError::InvalidMemoryAccess
    })?;
    if ptr == 0 && size > 0 {
        return Err(HostError::InvalidMemoryAccess);
    }
    write_bytes(caller, ptr, bytes)?;
    write_u32(caller, ret_ptr, ptr as u32)?;
    write_u32(caller, ret_size, size as u32)
}
