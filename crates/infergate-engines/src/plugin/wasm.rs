//! WebAssembly plugins
//!
//! Guests exchange UTF-8 JSON with the host through linear memory. Hook
//! exports take `(ptr, len)` and return `(ptr << 32) | len` of their
//! result, or a negative value on failure. Host functions live in the
//! `gateway` import module.
//!
//! Buffers the host writes are obtained from the guest's `alloc(len)`.
//! A guest exporting `dealloc(ptr, len)` gets every input buffer back once
//! its hook returns, and every result buffer once the host has read it.
//! Responses to `gateway.send_request` belong to the guest.
//!
//! Each call runs on an instance of its own, checked out of a pool. An
//! instance runs the entry point when it is created and replays the `load`
//! hook once the plugin has been loaded.

use super::{Capabilities, GatewayClient, NestedRequest, Plugin, PluginLoader};
use crate::engine::{Model, ModelHandle};
use async_trait::async_trait;
use infergate_core::{Error, Payload, Result, StatsSink};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use wasmtime::{Caller, Instance, InstancePre, Linker, Memory, Module, Store, TypedFunc};

/// Entry point every guest must export; called once per instance
pub const ENTRY_POINT: &str = "Preprocess";

/// Import module providing host functions
pub const HOST_MODULE: &str = "gateway";

/// Loads `.wasm` / `.wat` artifacts into a wasmtime sandbox
#[derive(Clone, Default)]
pub struct WasmPluginLoader {
    engine: wasmtime::Engine,
}

impl WasmPluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader sharing an existing wasmtime engine
    pub fn with_engine(engine: wasmtime::Engine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PluginLoader for WasmPluginLoader {
    async fn load(&self, path: &Path, gateway: GatewayClient) -> Result<Arc<dyn Plugin>> {
        let runtime = Handle::current();
        let engine = self.engine.clone();
        let path = path.to_path_buf();

        let plugin = tokio::task::spawn_blocking(move || {
            WasmPlugin::instantiate(&engine, path, gateway, runtime)
        })
        .await
        .map_err(|e| Error::internal(format!("plugin load task failed: {}", e)))??;

        Ok(Arc::new(plugin))
    }
}

/// State of one checked-out instance
struct HostState {
    gateway: GatewayClient,
    runtime: Handle,
    stats: StatsSink,
    last_error: Option<String>,
}

struct Guest {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dealloc: Option<TypedFunc<(i32, i32), ()>>,
    trapped: bool,
}

/// Idle instances of one compiled guest
struct GuestPool {
    pre: InstancePre<HostState>,
    gateway: GatewayClient,
    runtime: Handle,
    model_path: Mutex<Option<PathBuf>>,
    idle: Mutex<Vec<Guest>>,
}

/// A loaded WebAssembly plugin
pub struct WasmPlugin {
    pool: Arc<GuestPool>,
    capabilities: Capabilities,
    has_predict: bool,
    source: PathBuf,
}

impl WasmPlugin {
    fn instantiate(
        engine: &wasmtime::Engine,
        path: PathBuf,
        gateway: GatewayClient,
        runtime: Handle,
    ) -> Result<Self> {
        let module = Module::from_file(engine, &path)
            .map_err(|e| Error::plugin(format!("cannot compile {}: {:#}", path.display(), e)))?;

        let mut linker = Linker::new(engine);
        link_host_functions(&mut linker).map_err(guest_error)?;
        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| Error::plugin(format!("cannot link {}: {:#}", path.display(), e)))?;

        let exported = |name: &str| module.get_export(name).is_some();
        let capabilities = Capabilities {
            preprocess: exported("preprocess"),
            postprocess: exported("postprocess"),
            process: exported("process"),
            load: exported("load"),
        };
        let has_predict = exported("predict");

        let pool = GuestPool {
            pre,
            gateway,
            runtime,
            model_path: Mutex::new(None),
            idle: Mutex::new(Vec::new()),
        };

        // the first instance validates the exports and runs the entry point
        let first = pool.spawn()?;
        pool.idle.lock().push(first);

        info!("Instantiated WASM plugin {} ({:?})", path.display(), capabilities);

        Ok(Self {
            pool: Arc::new(pool),
            capabilities,
            has_predict,
            source: path,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Instances currently waiting for work
    pub fn idle_instances(&self) -> usize {
        self.pool.idle.lock().len()
    }

    async fn call_hook(
        &self,
        export: &'static str,
        data: Payload,
        stats: &StatsSink,
    ) -> Result<Payload> {
        call_json(&self.pool, export, data, stats.clone()).await
    }
}

async fn call_json(
    pool: &Arc<GuestPool>,
    export: &'static str,
    data: Payload,
    stats: StatsSink,
) -> Result<Payload> {
    let input = serde_json::to_vec(&data)?;
    let pool = Arc::clone(pool);

    let output = tokio::task::spawn_blocking(move || pool.call(export, &input, stats))
        .await
        .map_err(|e| Error::internal(format!("plugin task failed: {}", e)))??;

    if output.is_empty() {
        return Ok(Payload::Empty);
    }
    Ok(Payload::Json(serde_json::from_slice(&output)?))
}

impl GuestPool {
    /// Fresh instance with its entry point run
    fn spawn(&self) -> Result<Guest> {
        let mut store = Store::new(
            self.pre.module().engine(),
            HostState {
                gateway: self.gateway.clone(),
                runtime: self.runtime.clone(),
                stats: StatsSink::noop(),
                last_error: None,
            },
        );
        let instance = self
            .pre
            .instantiate(&mut store)
            .map_err(|e| Error::plugin(format!("cannot instantiate plugin: {:#}", e)))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::plugin("module does not export `memory`"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|e| {
                Error::plugin(format!("module does not export `alloc(i32) -> i32`: {:#}", e))
            })?;
        let dealloc = match instance.get_func(&mut store, "dealloc") {
            Some(func) => Some(func.typed::<(i32, i32), ()>(&store).map_err(|e| {
                Error::plugin(format!("`dealloc` must take (i32, i32): {:#}", e))
            })?),
            None => None,
        };
        let entry = instance
            .get_typed_func::<(), i32>(&mut store, ENTRY_POINT)
            .map_err(|_| {
                Error::plugin(format!("module does not export the `{}` entry point", ENTRY_POINT))
            })?;

        let status = entry.call(&mut store, ()).map_err(guest_error)?;
        if status != 0 {
            let reason = store.data_mut().last_error.take();
            return Err(Error::plugin(
                reason.unwrap_or_else(|| format!("`{}` returned {}", ENTRY_POINT, status)),
            ));
        }

        Ok(Guest {
            store,
            instance,
            memory,
            alloc,
            dealloc,
            trapped: false,
        })
    }

    /// Idle instance, or a new one loaded like the rest
    fn checkout(&self) -> Result<Guest> {
        if let Some(guest) = self.idle.lock().pop() {
            return Ok(guest);
        }

        let mut guest = self.spawn()?;
        if let Some(model_path) = self.model_path.lock().as_deref() {
            guest.load(model_path)?;
        }
        debug!("Spawned plugin instance");
        Ok(guest)
    }

    /// Trapped instances are dropped
    fn checkin(&self, guest: Guest) {
        if guest.trapped {
            debug!("Discarding trapped plugin instance");
            return;
        }
        self.idle.lock().push(guest);
    }

    fn call(&self, export: &str, input: &[u8], stats: StatsSink) -> Result<Vec<u8>> {
        let mut guest = self.checkout()?;
        let result = guest.call(export, input, stats);
        self.checkin(guest);
        result
    }

    /// Run the load hook on every instance, now and when later spawned
    fn load(&self, model_path: &Path) -> Result<()> {
        let mut current = self.model_path.lock();
        let mut idle = self.idle.lock();
        for guest in idle.iter_mut() {
            guest.load(model_path)?;
        }
        *current = Some(model_path.to_path_buf());
        Ok(())
    }
}

impl Guest {
    fn call(&mut self, export: &str, input: &[u8], stats: StatsSink) -> Result<Vec<u8>> {
        let state = self.store.data_mut();
        state.stats = stats;
        state.last_error = None;

        let result = self.call_inner(export, input);
        self.store.data_mut().stats = StatsSink::noop();
        result
    }

    fn call_inner(&mut self, export: &str, input: &[u8]) -> Result<Vec<u8>> {
        let func = self
            .instance
            .get_typed_func::<(i32, i32), i64>(&mut self.store, export)
            .map_err(|e| Error::plugin(format!("`{}` has the wrong signature: {:#}", export, e)))?;

        let (ptr, len) = self.write(input)?;
        let packed = match func.call(&mut self.store, (ptr, len)) {
            Ok(packed) => packed,
            Err(e) => {
                self.trapped = true;
                return Err(Error::plugin(format!("`{}` trapped: {:#}", export, e)));
            }
        };

        if packed < 0 {
            self.release(ptr, len)?;
            let reason = self.store.data_mut().last_error.take();
            return Err(Error::plugin(
                reason.unwrap_or_else(|| format!("`{}` failed with status {}", export, packed)),
            ));
        }

        let output = self.read(packed)?;
        let (out_ptr, out_len) = unpack(packed);
        self.release(ptr, len)?;
        // a hook may hand back its input buffer as the result
        if out_len > 0 && out_ptr != ptr as u32 as usize {
            self.release(out_ptr as u32 as i32, out_len as i32)?;
        }
        Ok(output)
    }

    fn load(&mut self, model_path: &Path) -> Result<()> {
        let func = self
            .instance
            .get_typed_func::<(i32, i32), i32>(&mut self.store, "load")
            .map_err(|e| Error::plugin(format!("`load` has the wrong signature: {:#}", e)))?;

        self.store.data_mut().last_error = None;
        let (ptr, len) = self.write(model_path.to_string_lossy().as_bytes())?;
        let status = match func.call(&mut self.store, (ptr, len)) {
            Ok(status) => status,
            Err(e) => {
                self.trapped = true;
                return Err(guest_error(e));
            }
        };
        self.release(ptr, len)?;

        if status != 0 {
            let reason = self.store.data_mut().last_error.take();
            return Err(Error::plugin(
                reason.unwrap_or_else(|| format!("`load` returned {}", status)),
            ));
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(i32, i32)> {
        let len = i32::try_from(bytes.len())
            .map_err(|_| Error::invalid_payload("payload too large for plugin memory"))?;
        let ptr = self.alloc.call(&mut self.store, len).map_err(|e| {
            self.trapped = true;
            guest_error(e)
        })?;
        self.memory
            .write(&mut self.store, ptr as u32 as usize, bytes)
            .map_err(|e| Error::plugin(format!("cannot write plugin memory: {}", e)))?;
        Ok((ptr, len))
    }

    fn read(&self, packed: i64) -> Result<Vec<u8>> {
        let (ptr, len) = unpack(packed);
        let mut buf = vec![0u8; len];
        self.memory
            .read(&self.store, ptr, &mut buf)
            .map_err(|e| Error::plugin(format!("cannot read plugin memory: {}", e)))?;
        Ok(buf)
    }

    /// Hand a buffer back to guests that export `dealloc`
    fn release(&mut self, ptr: i32, len: i32) -> Result<()> {
        let Some(dealloc) = &self.dealloc else {
            return Ok(());
        };
        if let Err(e) = dealloc.call(&mut self.store, (ptr, len)) {
            self.trapped = true;
            return Err(Error::plugin(format!("`dealloc` trapped: {:#}", e)));
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for WasmPlugin {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn preprocess(&self, request: Payload, stats: &StatsSink) -> Result<Payload> {
        self.call_hook("preprocess", request, stats).await
    }

    async fn postprocess(&self, data: Payload, stats: &StatsSink) -> Result<Payload> {
        self.call_hook("postprocess", data, stats).await
    }

    async fn process(&self, data: Payload, stats: &StatsSink) -> Result<Payload> {
        self.call_hook("process", data, stats).await
    }

    async fn load(&self, model_path: &Path) -> Result<Option<ModelHandle>> {
        let pool = Arc::clone(&self.pool);
        let model_path = model_path.to_path_buf();
        tokio::task::spawn_blocking(move || pool.load(&model_path))
            .await
            .map_err(|e| Error::internal(format!("plugin task failed: {}", e)))??;

        if !self.has_predict {
            return Ok(None);
        }
        Ok(Some(Arc::new(WasmModel {
            pool: Arc::clone(&self.pool),
            source: self.source.clone(),
        })))
    }
}

/// Model handle backed by a guest's `predict` export
struct WasmModel {
    pool: Arc<GuestPool>,
    source: PathBuf,
}

#[async_trait]
impl Model for WasmModel {
    async fn predict(&self, data: Payload) -> Result<Payload> {
        call_json(&self.pool, "predict", data, StatsSink::noop()).await
    }

    fn describe(&self) -> String {
        format!("wasm:{}", self.source.display())
    }
}

fn guest_error(e: wasmtime::Error) -> Error {
    Error::plugin(format!("{:#}", e))
}

/// Pack a guest pointer and length into the hook return value
pub fn pack(ptr: i32, len: i32) -> i64 {
    ((ptr as u32 as i64) << 32) | (len as u32 as i64)
}

fn unpack(packed: i64) -> (usize, usize) {
    (((packed >> 32) & 0xffff_ffff) as usize, (packed & 0xffff_ffff) as usize)
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("plugin does not export `memory`"))
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len.max(0) as usize];
    memory.read(&*caller, ptr as u32 as usize, &mut buf)?;
    Ok(buf)
}

fn write_guest(caller: &mut Caller<'_, HostState>, bytes: &[u8]) -> wasmtime::Result<i64> {
    let memory = guest_memory(caller)?;
    let alloc = caller
        .get_export("alloc")
        .and_then(|export| export.into_func())
        .ok_or_else(|| wasmtime::Error::msg("plugin does not export `alloc`"))?
        .typed::<i32, i32>(&*caller)?;

    let len = i32::try_from(bytes.len())?;
    let ptr = alloc.call(&mut *caller, len)?;
    memory.write(&mut *caller, ptr as u32 as usize, bytes)?;
    Ok(pack(ptr, len))
}

fn link_host_functions(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "send_request",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<i64> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let response = match serde_json::from_slice::<NestedRequest>(&bytes) {
                Ok(request) => {
                    let gateway = caller.data().gateway.clone();
                    let runtime = caller.data().runtime.clone();
                    let version = request.version.as_deref();
                    let call = gateway.send_request(&request.endpoint, version, &request.data);
                    runtime.block_on(call)
                }
                Err(e) => {
                    warn!("Plugin sent a malformed nested request: {}", e);
                    None
                }
            };

            let body = serde_json::to_vec(&response.unwrap_or(Value::Null))?;
            write_guest(&mut caller, &body)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "collect_statistics",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(stats) => caller.data().stats.emit_value(stats),
                Err(e) => debug!("Dropping undecodable plugin statistics: {}", e),
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "report_error",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            caller.data_mut().last_error = Some(String::from_utf8_lossy(&bytes).into_owned());
            Ok(())
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        assert_eq!(unpack(pack(1024, 17)), (1024, 17));
        assert_eq!(unpack(pack(0, 0)), (0, 0));
        assert!(pack(0x7fff_ffff, 1) > 0);
    }
}
