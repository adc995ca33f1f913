//! Helpers shared by the unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, OnceLock};

use wasmtime::{Instance, Store, StoreLimits};
use wasmtime_wasi::WasiCtxBuilder;

use crate::abi::{EXPORT_FREE, EXPORT_MALLOC, EXPORT_MEMORY};
use crate::memory::Marshaler;
use crate::module::{HostState, ProtocModule};
use crate::plugin::{CommandPluginHandler, PluginHandler};

/// Guest implementing the protoc ABI, shared with the integration tests.
pub(crate) const FIXTURE_WAT: &str = include_str!("../tests/fixtures/fake_protoc.wat");

/// The fixture compiled once per test binary.
pub(crate) fn fixture_module() -> ProtocModule {
    static MODULE: OnceLock<ProtocModule> = OnceLock::new();
    MODULE
        .get_or_init(|| ProtocModule::from_binary(FIXTURE_WAT.as_bytes()).unwrap())
        .clone()
}

/// A bare instance with its marshaler, below the `Protoc` layer.
pub(crate) struct Sandbox {
    pub(crate) store: Store<HostState>,
    pub(crate) instance: Instance,
    pub(crate) marshaler: Marshaler,
}

impl Sandbox {
    pub(crate) async fn fixture() -> Self {
        Self::instantiate(&fixture_module(), Arc::new(CommandPluginHandler::new())).await
    }

    pub(crate) async fn from_wat(wat: &str) -> Self {
        Self::from_wat_with_handler(wat, Arc::new(CommandPluginHandler::new())).await
    }

    pub(crate) async fn from_wat_with_handler(
        wat: &str,
        handler: Arc<dyn PluginHandler>,
    ) -> Self {
        Self::instantiate(&ProtocModule::from_binary(wat.as_bytes()).unwrap(), handler).await
    }

    async fn instantiate(module: &ProtocModule, handler: Arc<dyn PluginHandler>) -> Self {
        let state = HostState::new(
            WasiCtxBuilder::new().build_p1(),
            StoreLimits::default(),
            handler,
        );
        let (mut store, instance) = module.instantiate(state).await.unwrap();

        let memory = instance.get_memory(&mut store, EXPORT_MEMORY).unwrap();
        let malloc = instance
            .get_typed_func::<u32, u32>(&mut store, EXPORT_MALLOC)
            .unwrap();
        let free = instance
            .get_typed_func::<u32, ()>(&mut store, EXPORT_FREE)
            .unwrap();
        let marshaler = Marshaler::new(memory, malloc, free);
        store.data_mut().marshaler = Some(marshaler.clone());

        Self {
            store,
            instance,
            marshaler,
        }
    }
}

/// Blocks the guest allocator considers live.
pub(crate) async fn guest_live_allocations(
    store: &mut Store<HostState>,
    instance: &Instance,
) -> i32 {
    instance
        .get_typed_func::<(), i32>(&mut *store, "live_allocations")
        .unwrap()
        .call_async(&mut *store, ())
        .await
        .unwrap()
}
