//! A protoc instance and its lifecycle calls.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use wasmtime::{Instance, Store, TypedFunc};

use crate::abi::{
    DEFAULT_PROGRAM_NAME, EXPORT_FREE, EXPORT_MALLOC, EXPORT_MEMORY, EXPORT_PROTOC_DESTROY,
    EXPORT_PROTOC_INIT, EXPORT_PROTOC_RUN,
};
use crate::config::ProtocConfig;
use crate::error::Error;
use crate::memory::{GuestArgv, Marshaler};
use crate::module::{HostState, ProtocModule};
use crate::state::{Lifecycle, LifecycleState};

/// Typed handles to the guest's lifecycle exports.
struct GuestExports {
    marshaler: Marshaler,
    init: TypedFunc<(), i32>,
    run: TypedFunc<(i32, u32), i32>,
    destroy: TypedFunc<(), ()>,
}

impl GuestExports {
    fn resolve(store: &mut Store<HostState>, instance: &Instance) -> Result<Self, Error> {
        fn typed<P, R>(
            store: &mut Store<HostState>,
            instance: &Instance,
            name: &'static str,
        ) -> Result<TypedFunc<P, R>, Error>
        where
            P: wasmtime::WasmParams,
            R: wasmtime::WasmResults,
        {
            instance
                .get_typed_func::<P, R>(&mut *store, name)
                .map_err(|e| Error::MissingExport {
                    name,
                    reason: format!("{e:#}"),
                })
        }

        let memory =
            instance
                .get_memory(&mut *store, EXPORT_MEMORY)
                .ok_or(Error::MissingExport {
                    name: EXPORT_MEMORY,
                    reason: "no exported memory".to_string(),
                })?;

        Ok(Self {
            marshaler: Marshaler::new(
                memory,
                typed(store, instance, EXPORT_MALLOC)?,
                typed(store, instance, EXPORT_FREE)?,
            ),
            init: typed(store, instance, EXPORT_PROTOC_INIT)?,
            run: typed(store, instance, EXPORT_PROTOC_RUN)?,
            destroy: typed(store, instance, EXPORT_PROTOC_DESTROY)?,
        })
    }
}

struct Sandbox {
    store: Store<HostState>,
    exports: GuestExports,
}

struct Inner {
    lifecycle: Lifecycle,
    /// Released on destroy.
    sandbox: Option<Sandbox>,
}

/// One sandboxed protoc instance.
///
/// Each instance has its own linear memory, WASI context and lifecycle. Calls
/// are serialized: `init`, `run` and `destroy` wait for each other, so an
/// instance can be shared across tasks behind an `Arc`.
///
/// # Example
///
/// ```rust,ignore
/// use protoc_wasi::{CapturedOutput, OutputSink, Protoc, ProtocConfig, ProtocModule};
///
/// let module = ProtocModule::from_file("protoc.wasm")?;
/// let stdout = CapturedOutput::new();
/// let protoc = Protoc::new(
///     &module,
///     ProtocConfig::new().with_stdout(OutputSink::Capture(stdout.clone())),
/// )
/// .await?;
///
/// protoc.init().await?;
/// let code = protoc.run(&["protoc", "--version"]).await?;
/// assert_eq!(code, 0);
/// println!("{}", stdout.to_string_lossy());
/// protoc.destroy().await;
/// ```
pub struct Protoc {
    inner: Mutex<Inner>,
    run_timeout: Option<Duration>,
}

impl std::fmt::Debug for Protoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Protoc");
        if let Ok(inner) = self.inner.try_lock() {
            debug.field("state", &inner.lifecycle.state());
        }
        debug
            .field("run_timeout", &self.run_timeout)
            .finish_non_exhaustive()
    }
}

impl Protoc {
    /// Instantiate `module` with `config`.
    ///
    /// The instance starts in [`LifecycleState::Created`]; call
    /// [`init`](Self::init) before running.
    ///
    /// # Errors
    ///
    /// Returns an error if a mount is invalid, the module cannot be
    /// instantiated, or it does not export the protoc ABI.
    pub async fn new(module: &ProtocModule, config: ProtocConfig) -> Result<Self, Error> {
        let wasi = config.build_wasi()?;
        let state = HostState::new(wasi, config.build_limits(), config.plugin_handler.clone());

        let (mut store, instance) = module.instantiate(state).await?;
        let exports = GuestExports::resolve(&mut store, &instance)?;
        store.data_mut().marshaler = Some(exports.marshaler.clone());

        tracing::debug!(mounts = config.mounts.len(), "Instantiated protoc");

        Ok(Self {
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::new(),
                sandbox: Some(Sandbox { store, exports }),
            }),
            run_timeout: config.run_timeout,
        })
    }

    /// Initialize the protoc reactor. Idempotent.
    ///
    /// # Errors
    ///
    /// - [`Error::InitFailed`] if the guest reports failure (the instance stays
    ///   `Created`) or traps (the instance becomes `Faulted`).
    /// - [`Error::Destroyed`] / [`Error::InstanceFaulted`] from those states.
    #[tracing::instrument(skip(self))]
    pub async fn init(&self) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if inner.lifecycle.can_init()? {
            return Ok(());
        }
        let sandbox = inner.sandbox.as_mut().ok_or(Error::Destroyed)?;

        match sandbox.exports.init.call_async(&mut sandbox.store, ()).await {
            Ok(0) => {
                inner.lifecycle.initialized();
                tracing::info!("protoc initialized");
                Ok(())
            }
            Ok(status) => Err(Error::InitFailed(format!(
                "{EXPORT_PROTOC_INIT} returned {status}"
            ))),
            Err(e) => {
                let reason = format!("{EXPORT_PROTOC_INIT} trapped: {e:#}");
                inner.lifecycle.fault(reason.clone());
                Err(Error::InitFailed(reason))
            }
        }
    }

    /// Run protoc with `args` and return its exit code.
    ///
    /// `args[0]` is the program name, as in a C `argv`; an empty slice runs
    /// `protoc` with no arguments. A non-zero exit code is protoc's own
    /// failure signal and is returned as `Ok`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`], [`Error::Destroyed`] or
    ///   [`Error::InstanceFaulted`] if the instance cannot run.
    /// - [`Error::AllocationFailed`] / [`Error::MemoryAccessFailed`] if the
    ///   arguments cannot be copied into the guest.
    /// - [`Error::RunFailed`] if the guest traps or the run timeout expires.
    pub async fn run<S>(&self, args: &[S]) -> Result<i32, Error>
    where
        S: AsRef<str> + Sync,
    {
        self.run_with_cancel(args, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but stops when `cancel` is cancelled.
    ///
    /// Cancellation interrupts guest code within a few milliseconds and kills
    /// any plugin process in flight. An interrupted run fails with
    /// [`Error::RunFailed`] and leaves the instance faulted.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    #[tracing::instrument(skip(self, args, cancel), fields(argc = args.len().max(1)))]
    pub async fn run_with_cancel<S>(
        &self,
        args: &[S],
        cancel: CancellationToken,
    ) -> Result<i32, Error>
    where
        S: AsRef<str> + Sync,
    {
        let args: Vec<String> = if args.is_empty() {
            vec![DEFAULT_PROGRAM_NAME.to_string()]
        } else {
            args.iter().map(|arg| arg.as_ref().to_string()).collect()
        };

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        inner.lifecycle.can_run()?;
        if cancel.is_cancelled() {
            return Err(Error::RunFailed("cancelled before start".to_string()));
        }
        let Sandbox { store, exports } = inner.sandbox.as_mut().ok_or(Error::Destroyed)?;

        let argv = match GuestArgv::allocate(&exports.marshaler, store, &args).await {
            Ok(argv) => argv,
            Err(e) => {
                if let Some(reason) = store.data_mut().fault.take() {
                    inner.lifecycle.fault(reason);
                }
                return Err(e);
            }
        };

        let token = cancel.child_token();
        let timer = self.run_timeout.map(|timeout| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        });

        store.data_mut().arm(token.clone());
        store.set_epoch_deadline(1);
        let result = exports
            .run
            .call_async(&mut *store, (argv.argc(), argv.argv().get()))
            .await;
        let interrupted = store.data_mut().disarm();
        if let Some(timer) = timer {
            timer.abort();
        }

        argv.free(&exports.marshaler, store).await;
        if let Some(reason) = store.data_mut().fault.take() {
            inner.lifecycle.fault(reason);
        }

        // A cancelled plugin may let the guest return normally, so the token
        // decides, not the trap.
        let stopped = if cancel.is_cancelled() {
            Some("cancelled".to_string())
        } else if token.is_cancelled() {
            Some(format!(
                "deadline of {:?} exceeded",
                self.run_timeout.unwrap_or_default()
            ))
        } else {
            None
        };

        match (result, stopped) {
            (Ok(code), None) => {
                tracing::debug!(exit_code = code, "protoc run finished");
                Ok(code)
            }
            (Err(e), None) => {
                let reason = format!("{EXPORT_PROTOC_RUN} trapped: {e:#}");
                inner.lifecycle.fault(reason.clone());
                Err(Error::RunFailed(reason))
            }
            (_, Some(reason)) => {
                tracing::debug!(interrupted, reason = %reason, "protoc run stopped");
                inner.lifecycle.fault(reason.clone());
                Err(Error::RunFailed(reason))
            }
        }
    }

    /// Tear the instance down. Idempotent and infallible.
    ///
    /// The guest destroy export is only called on an initialized instance;
    /// its failures are logged. The sandbox is released in every case.
    #[tracing::instrument(skip(self))]
    pub async fn destroy(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let Some(call_guest) = inner.lifecycle.begin_destroy() else {
            return;
        };
        if let Some(mut sandbox) = inner.sandbox.take() {
            if call_guest
                && let Err(e) = sandbox
                    .exports
                    .destroy
                    .call_async(&mut sandbox.store, ())
                    .await
            {
                tracing::warn!(error = %e, "{EXPORT_PROTOC_DESTROY} failed");
            }
            let outstanding = sandbox.store.data().allocations;
            if outstanding > 0 {
                tracing::warn!(outstanding, "Destroyed with outstanding guest allocations");
            }
        }
        tracing::info!("protoc destroyed");
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.lifecycle.state()
    }

    /// Guest allocations currently owned by the host.
    ///
    /// Zero whenever no call is in flight; a non-zero value indicates a leak.
    pub async fn outstanding_allocations(&self) -> usize {
        self.inner
            .lock()
            .await
            .sandbox
            .as_ref()
            .map_or(0, |sandbox| sandbox.store.data().allocations)
    }

    /// Number of plugin exchanges served by this instance.
    pub async fn plugin_calls(&self) -> u64 {
        self.inner
            .lock()
            .await
            .sandbox
            .as_ref()
            .map_or(0, |sandbox| sandbox.store.data().plugin_calls)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{CapturedOutput, OutputSink};
    use crate::test_support::fixture_module;

    async fn fixture_protoc(config: ProtocConfig) -> Protoc {
        Protoc::new(&fixture_module(), config).await.unwrap()
    }

    #[tokio::test]
    async fn test_missing_export_is_reported() {
        let module = ProtocModule::from_binary(
            br#"(module
                (memory (export "memory") 1)
                (func (export "malloc") (param i32) (result i32) (i32.const 0))
                (func (export "free") (param i32)))"#,
        )
        .unwrap();
        let err = Protoc::new(&module, ProtocConfig::new()).await.unwrap_err();
        match err {
            Error::MissingExport { name, .. } => assert_eq!(name, EXPORT_PROTOC_INIT),
            other => panic!("expected MissingExport, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_signature_is_reported() {
        let module = ProtocModule::from_binary(
            br#"(module
                (memory (export "memory") 1)
                (func (export "malloc") (param i64) (result i32) (i32.const 0))
                (func (export "free") (param i32)))"#,
        )
        .unwrap();
        let err = Protoc::new(&module, ProtocConfig::new()).await.unwrap_err();
        assert!(
            matches!(err, Error::MissingExport { name: EXPORT_MALLOC, .. }),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_nonzero_init_keeps_created() {
        let module = ProtocModule::from_binary(
            br#"(module
                (memory (export "memory") 1)
                (func (export "malloc") (param i32) (result i32) (i32.const 0))
                (func (export "free") (param i32))
                (func (export "protoc_init") (result i32) (i32.const 7))
                (func (export "protoc_run") (param i32 i32) (result i32) (i32.const 0))
                (func (export "protoc_destroy")))"#,
        )
        .unwrap();
        let protoc = Protoc::new(&module, ProtocConfig::new()).await.unwrap();

        let err = protoc.init().await.unwrap_err();
        assert!(matches!(err, Error::InitFailed(ref m) if m.contains('7')), "got {err:?}");
        assert_eq!(protoc.state().await, LifecycleState::Created);
    }

    #[tokio::test]
    async fn test_trapping_init_faults() {
        let module = ProtocModule::from_binary(
            br#"(module
                (memory (export "memory") 1)
                (func (export "malloc") (param i32) (result i32) (i32.const 0))
                (func (export "free") (param i32))
                (func (export "protoc_init") (result i32) (unreachable))
                (func (export "protoc_run") (param i32 i32) (result i32) (i32.const 0))
                (func (export "protoc_destroy")))"#,
        )
        .unwrap();
        let protoc = Protoc::new(&module, ProtocConfig::new()).await.unwrap();

        assert!(matches!(protoc.init().await, Err(Error::InitFailed(_))));
        assert_eq!(protoc.state().await, LifecycleState::Faulted);
        assert!(matches!(protoc.init().await, Err(Error::InstanceFaulted(_))));

        protoc.destroy().await;
        assert_eq!(protoc.state().await, LifecycleState::Destroyed);
    }

    #[tokio::test]
    async fn test_empty_args_use_default_program_name() {
        let stderr = CapturedOutput::new();
        let protoc =
            fixture_protoc(ProtocConfig::new().with_stderr(OutputSink::Capture(stderr.clone())))
                .await;
        protoc.init().await.unwrap();

        let empty: [&str; 0] = [];
        let code = protoc.run(&empty).await.unwrap();
        assert_eq!(code, 1);
        assert!(stderr.to_string_lossy().contains("Missing input file."));
        assert_eq!(protoc.outstanding_allocations().await, 0);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_does_not_fault() {
        let protoc = fixture_protoc(ProtocConfig::new()).await;
        protoc.init().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = protoc
            .run_with_cancel(&["protoc", "--version"], cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RunFailed(_)), "got {err:?}");
        assert_eq!(protoc.state().await, LifecycleState::Initialized);
        assert_eq!(protoc.run(&["protoc", "--version"]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_debug_shows_state() {
        let protoc = fixture_protoc(ProtocConfig::new()).await;
        let debug = format!("{protoc:?}");
        assert!(debug.contains("Created"), "{debug}");
    }
}
