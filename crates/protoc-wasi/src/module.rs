//! WebAssembly runtime setup and host state.
//!
//! This module handles the wasmtime engine configuration, module loading and
//! the linker that provides WASI preview1 plus the plugin host import.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wasmtime::{
    Config, Engine, Instance, Linker, Module, Store, StoreContextMut, StoreLimits, Trap,
    UpdateDeadline,
};
use wasmtime_wasi::p1::{self, WasiP1Ctx};

use crate::abi::EXPORT_INITIALIZE;
use crate::error::Error;
use crate::gateway;
use crate::memory::Marshaler;
use crate::plugin::PluginHandler;

/// Interval between engine epoch increments.
///
/// This bounds how long a cancelled or timed out run keeps executing guest code.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Per-instance state stored in the wasmtime `Store`.
///
/// The plugin gateway reaches this through its `Caller`, so the dispatcher and
/// the callback always observe the same ledger and cancellation state.
pub(crate) struct HostState {
    /// WASI preview1 context (stdio, mounts, environment).
    wasi: WasiP1Ctx,
    /// Linear memory limits.
    limits: StoreLimits,
    /// Strategy used to run plugin subprocesses.
    pub(crate) plugin_handler: Arc<dyn PluginHandler>,
    /// Allocator exports, set once the instance exists.
    pub(crate) marshaler: Option<Marshaler>,
    /// Host-owned guest allocations not yet freed or handed over.
    pub(crate) allocations: usize,
    /// Plugin exchanges served over the lifetime of the instance.
    pub(crate) plugin_calls: u64,
    /// First unrecoverable failure observed inside a host-initiated call.
    pub(crate) fault: Option<String>,
    /// Token for the run in flight, if any.
    run_token: Option<CancellationToken>,
    /// Set when the epoch callback interrupted the guest.
    interrupted: bool,
}

impl HostState {
    pub(crate) fn new(
        wasi: WasiP1Ctx,
        limits: StoreLimits,
        plugin_handler: Arc<dyn PluginHandler>,
    ) -> Self {
        Self {
            wasi,
            limits,
            plugin_handler,
            marshaler: None,
            allocations: 0,
            plugin_calls: 0,
            fault: None,
            run_token: None,
            interrupted: false,
        }
    }

    /// Token plugin exchanges should honour.
    ///
    /// Outside of a run this is a fresh token that is never cancelled.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.run_token.clone().unwrap_or_default()
    }

    /// Install the token for a run. Guest code is interrupted once it is cancelled.
    pub(crate) fn arm(&mut self, token: CancellationToken) {
        self.run_token = Some(token);
        self.interrupted = false;
    }

    /// Remove the run token, returning whether the guest was interrupted.
    pub(crate) fn disarm(&mut self) -> bool {
        self.run_token = None;
        std::mem::take(&mut self.interrupted)
    }

    /// Record a fault. Only the first reason is kept.
    pub(crate) fn record_fault(&mut self, reason: String) {
        if self.fault.is_none() {
            self.fault = Some(reason);
        }
    }
}

/// Epoch callback: trap when the active run was cancelled, otherwise yield.
fn on_epoch_deadline(
    mut ctx: StoreContextMut<'_, HostState>,
) -> wasmtime::Result<UpdateDeadline> {
    let state = ctx.data_mut();
    if let Some(token) = &state.run_token
        && token.is_cancelled()
    {
        state.interrupted = true;
        return Err(Trap::Interrupt.into());
    }
    Ok(UpdateDeadline::Yield(1))
}

/// A compiled protoc module, ready to be instantiated.
///
/// Compilation of `protoc.wasm` is expensive; compile once and create as many
/// [`Protoc`](crate::Protoc) instances from it as needed. Cloning is cheap.
#[derive(Clone)]
pub struct ProtocModule {
    engine: Engine,
    module: Module,
    linker: Arc<Linker<HostState>>,
}

impl std::fmt::Debug for ProtocModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocModule")
            .field("engine", &"<wasmtime::Engine>")
            .field("module", &self.module.name().unwrap_or("<unnamed>"))
            .finish_non_exhaustive()
    }
}

impl ProtocModule {
    /// Compile a module from bytes.
    ///
    /// Both binary modules and the WebAssembly text format are accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the module cannot be compiled or the wasmtime
    /// engine cannot be configured.
    pub fn from_binary(wasm_bytes: &[u8]) -> Result<Self, Error> {
        let engine = Self::create_engine()?;
        let module =
            Module::new(&engine, wasm_bytes).map_err(|e| Error::WasmModule(format!("{e:#}")))?;
        Self::with_module(engine, module)
    }

    /// Compile a module from a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, or an error if the
    /// module cannot be compiled.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let wasm_bytes = std::fs::read(path)?;
        let engine = Self::create_engine()?;
        let module = Module::new(&engine, &wasm_bytes)
            .map_err(|e| Error::WasmModule(format!("{}: {e:#}", path.display())))?;
        Self::with_module(engine, module)
    }

    fn with_module(engine: Engine, module: Module) -> Result<Self, Error> {
        let linker = Self::create_linker(&engine)?;
        tracing::debug!(
            imports = module.imports().len(),
            exports = module.exports().len(),
            "Compiled protoc module"
        );
        Ok(Self {
            engine,
            module,
            linker: Arc::new(linker),
        })
    }

    /// Create a configured wasmtime engine and start its epoch ticker.
    fn create_engine() -> Result<Engine, Error> {
        let mut config = Config::new();
        config.epoch_interruption(true);

        let engine = Engine::new(&config).map_err(|e| Error::WasmEngine(e.to_string()))?;
        spawn_epoch_ticker(&engine)?;
        Ok(engine)
    }

    /// Create a linker with WASI preview1 and the plugin host import.
    fn create_linker(engine: &Engine) -> Result<Linker<HostState>, Error> {
        let mut linker = Linker::<HostState>::new(engine);

        p1::add_to_linker_async(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| Error::WasmEngine(format!("Failed to add WASI to linker: {e}")))?;

        gateway::add_to_linker(&mut linker)?;

        Ok(linker)
    }

    /// Instantiate the module into a fresh store.
    ///
    /// Calls the reactor's `_initialize` export when the module has one.
    pub(crate) async fn instantiate(
        &self,
        state: HostState,
    ) -> Result<(Store<HostState>, Instance), Error> {
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store.epoch_deadline_callback(on_epoch_deadline);
        store.set_epoch_deadline(1);

        let instance = self
            .linker
            .instantiate_async(&mut store, &self.module)
            .await
            .map_err(|e| Error::Instantiation(format!("{e:#}")))?;

        if let Some(initialize) = instance.get_func(&mut store, EXPORT_INITIALIZE) {
            let initialize =
                initialize
                    .typed::<(), ()>(&store)
                    .map_err(|e| Error::MissingExport {
                        name: EXPORT_INITIALIZE,
                        reason: e.to_string(),
                    })?;
            initialize
                .call_async(&mut store, ())
                .await
                .map_err(|e| Error::Instantiation(format!("{EXPORT_INITIALIZE} failed: {e:#}")))?;
        }

        Ok((store, instance))
    }
}

/// Increment the engine epoch until the engine is dropped.
fn spawn_epoch_ticker(engine: &Engine) -> Result<(), Error> {
    let weak = engine.weak();
    std::thread::Builder::new()
        .name("protoc-wasi-epoch".to_string())
        .spawn(move || {
            loop {
                std::thread::sleep(EPOCH_TICK);
                match weak.upgrade() {
                    Some(engine) => engine.increment_epoch(),
                    None => break,
                }
            }
        })
        .map_err(|e| Error::WasmEngine(format!("Failed to start epoch ticker: {e}")))?;
    Ok(())
}
