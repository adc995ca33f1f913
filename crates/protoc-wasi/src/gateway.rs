//! The `protoc.plugin_communicate` host import.
//!
//! Called by the guest in the middle of `protoc_run` whenever a code generator
//! plugin is needed. The gateway copies the program name and request out of
//! guest memory, runs the plugin through the instance's [`PluginHandler`], and
//! writes either the response or an error message back as a guest-owned
//! buffer.
//!
//! [`PluginHandler`]: crate::PluginHandler

use wasmtime::{Caller, Linker};

use crate::abi::{IMPORT_MODULE, IMPORT_PLUGIN_COMMUNICATE};
use crate::error::Error;
use crate::memory::{GuestPtr, Marshaler};
use crate::module::HostState;
use crate::plugin::PluginRequest;

/// Status returned to the guest by `plugin_communicate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PluginStatus {
    /// Output slots hold the plugin response; error slots are zero.
    Success = 0,
    /// Error slots hold the error message; output slots are zero.
    PluginError = 1,
    /// The request or result could not be marshaled. Slot contents are
    /// unspecified but never reference live host allocations.
    MarshalError = -1,
}

impl PluginStatus {
    /// The value the guest receives.
    #[must_use]
    pub const fn as_word(self) -> i32 {
        self as i32
    }
}

/// Guest addresses the results are written to.
#[derive(Debug, Clone, Copy)]
struct ResultSlots {
    output_ptr: GuestPtr,
    output_len: GuestPtr,
    error_ptr: GuestPtr,
    error_len: GuestPtr,
}

impl ResultSlots {
    /// Write `(ptr, len)` into one slot pair and clear the other.
    fn fill(
        &self,
        marshaler: &Marshaler,
        caller: &mut Caller<'_, HostState>,
        status: PluginStatus,
        ptr: GuestPtr,
        len: u32,
    ) -> Result<(), Error> {
        let (set_ptr, set_len, clear_ptr, clear_len) = match status {
            PluginStatus::Success => (
                self.output_ptr,
                self.output_len,
                self.error_ptr,
                self.error_len,
            ),
            PluginStatus::PluginError | PluginStatus::MarshalError => (
                self.error_ptr,
                self.error_len,
                self.output_ptr,
                self.output_len,
            ),
        };
        marshaler.write_u32(&mut *caller, set_ptr, ptr.get())?;
        marshaler.write_u32(&mut *caller, set_len, len)?;
        marshaler.write_u32(&mut *caller, clear_ptr, 0)?;
        marshaler.write_u32(&mut *caller, clear_len, 0)
    }

    /// Zero every slot that is addressable.
    fn clear(&self, marshaler: &Marshaler, caller: &mut Caller<'_, HostState>) {
        for slot in [
            self.output_ptr,
            self.output_len,
            self.error_ptr,
            self.error_len,
        ] {
            let _ = marshaler.write_u32(&mut *caller, slot, 0);
        }
    }
}

/// Register the plugin import on `linker`.
pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> Result<(), Error> {
    linker
        .func_wrap_async(
            IMPORT_MODULE,
            IMPORT_PLUGIN_COMMUNICATE,
            |mut caller: Caller<'_, HostState>,
             (
                program_ptr,
                program_len,
                search_path,
                input_ptr,
                input_len,
                output_ptr,
                output_len,
                error_ptr,
                error_len,
            ): (u32, u32, i32, u32, u32, u32, u32, u32, u32)| {
                Box::new(async move {
                    let slots = ResultSlots {
                        output_ptr: GuestPtr::new(output_ptr),
                        output_len: GuestPtr::new(output_len),
                        error_ptr: GuestPtr::new(error_ptr),
                        error_len: GuestPtr::new(error_len),
                    };
                    let status = plugin_communicate(
                        &mut caller,
                        GuestPtr::new(program_ptr),
                        program_len,
                        search_path != 0,
                        GuestPtr::new(input_ptr),
                        input_len,
                        slots,
                    )
                    .await;
                    status.as_word()
                })
            },
        )
        .map_err(|e| {
            Error::WasmEngine(format!(
                "Failed to register {IMPORT_MODULE}.{IMPORT_PLUGIN_COMMUNICATE}: {e}"
            ))
        })?;
    Ok(())
}

async fn plugin_communicate(
    caller: &mut Caller<'_, HostState>,
    program_ptr: GuestPtr,
    program_len: u32,
    search_path: bool,
    input_ptr: GuestPtr,
    input_len: u32,
    slots: ResultSlots,
) -> PluginStatus {
    let Some(marshaler) = caller.data().marshaler.clone() else {
        tracing::error!("plugin_communicate called before the instance was ready");
        return PluginStatus::MarshalError;
    };

    let request = marshaler
        .read_bytes(&*caller, program_ptr, program_len)
        .and_then(|program| {
            let input = marshaler.read_bytes(&*caller, input_ptr, input_len)?;
            Ok((program, input))
        });
    let (program, input) = match request {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected plugin request");
            return PluginStatus::MarshalError;
        }
    };
    let program = String::from_utf8_lossy(&program).into_owned();

    let handler = caller.data().plugin_handler.clone();
    let cancel = caller.data().cancel_token();
    caller.data_mut().plugin_calls += 1;

    tracing::debug!(
        program = %program,
        search_path,
        input_len = input.len(),
        "Running plugin"
    );

    let result = handler
        .communicate(
            PluginRequest {
                program: &program,
                search_path,
                input: &input,
            },
            cancel,
        )
        .await;

    let (status, payload) = match result {
        Ok(output) => {
            tracing::debug!(program = %program, output_len = output.len(), "Plugin succeeded");
            (PluginStatus::Success, output)
        }
        Err(e) => {
            let message = Error::PluginCommunicationFailed(e).to_string();
            tracing::debug!(program = %program, error = %message, "Plugin failed");
            (PluginStatus::PluginError, message.into_bytes())
        }
    };

    match deliver(&marshaler, caller, &slots, status, &payload).await {
        Ok(()) => status,
        Err(e) => {
            tracing::warn!(program = %program, error = %e, "Failed to deliver plugin result");
            slots.clear(&marshaler, caller);
            PluginStatus::MarshalError
        }
    }
}

/// Copy `payload` into a fresh guest buffer and hand it to the guest through
/// the slots for `status`. The buffer is freed if the slots can't be written.
async fn deliver(
    marshaler: &Marshaler,
    caller: &mut Caller<'_, HostState>,
    slots: &ResultSlots,
    status: PluginStatus,
    payload: &[u8],
) -> Result<(), Error> {
    let allocation = marshaler.allocate_bytes(caller, payload).await?;
    if let Err(e) = slots.fill(marshaler, caller, status, allocation.ptr(), allocation.len()) {
        marshaler.free(caller, allocation).await;
        return Err(e);
    }
    let _ = marshaler.hand_over(caller, allocation);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;
    use wasmtime::TypedFunc;

    use super::*;
    use crate::plugin::{PluginError, PluginHandler};
    use crate::test_support::{Sandbox, guest_live_allocations};

    /// Guest that forwards `communicate` straight to the import. The program
    /// name sits at 16 and the request at 64; `malloc` bumps from 1024 and
    /// counts live blocks.
    const FORWARDING_WAT: &str = r#"(module
        (import "protoc" "plugin_communicate"
            (func $communicate (param i32 i32 i32 i32 i32 i32 i32 i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 16) "protoc-gen-x")
        (data (i32.const 64) "request")
        (global $next (mut i32) (i32.const 1024))
        (global $live (mut i32) (i32.const 0))
        (func (export "malloc") (param $size i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $next))
            (global.set $next (i32.add (global.get $next) (i32.add (local.get $size) (i32.const 8))))
            (global.set $live (i32.add (global.get $live) (i32.const 1)))
            (local.get $ptr))
        (func (export "free") (param i32)
            (if (local.get 0)
                (then (global.set $live (i32.sub (global.get $live) (i32.const 1))))))
        (func (export "live_allocations") (result i32) (global.get $live))
        (func (export "communicate")
            (param i32 i32 i32 i32 i32 i32 i32 i32 i32) (result i32)
            (call $communicate
                (local.get 0) (local.get 1) (local.get 2) (local.get 3) (local.get 4)
                (local.get 5) (local.get 6) (local.get 7) (local.get 8)))
        (func (export "protoc_init") (result i32) (i32.const 0))
        (func (export "protoc_run") (param i32 i32) (result i32) (i32.const 0))
        (func (export "protoc_destroy")))"#;

    const PROGRAM: (u32, u32) = (16, 12);
    const INPUT: (u32, u32) = (64, 7);
    const SLOTS: [u32; 4] = [256, 260, 264, 268];
    const OUT_OF_BOUNDS: u32 = 0xffff_0000;

    type CommunicateArgs = (u32, u32, i32, u32, u32, u32, u32, u32, u32);

    /// Answers every request with a fixed response and counts the calls.
    #[derive(Default)]
    struct CountingPlugin {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PluginHandler for CountingPlugin {
        async fn communicate(
            &self,
            request: PluginRequest<'_>,
            _cancel: CancellationToken,
        ) -> Result<Vec<u8>, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.program, "protoc-gen-x");
            assert_eq!(request.input, b"request");
            Ok(b"response".to_vec())
        }
    }

    async fn forwarding_sandbox() -> (Sandbox, Arc<CountingPlugin>, TypedFunc<CommunicateArgs, i32>) {
        let plugin = Arc::new(CountingPlugin::default());
        let mut sandbox = Sandbox::from_wat_with_handler(FORWARDING_WAT, plugin.clone()).await;
        let communicate = sandbox
            .instance
            .get_typed_func::<CommunicateArgs, i32>(&mut sandbox.store, "communicate")
            .unwrap();
        (sandbox, plugin, communicate)
    }

    fn args(program: (u32, u32), input: (u32, u32), slots: [u32; 4]) -> CommunicateArgs {
        (
            program.0, program.1, 0, input.0, input.1, slots[0], slots[1], slots[2], slots[3],
        )
    }

    fn read_u32(sandbox: &Sandbox, slot: u32) -> u32 {
        let bytes = sandbox
            .marshaler
            .read_bytes(&sandbox.store, GuestPtr::new(slot), 4)
            .unwrap();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test]
    fn test_status_words() {
        assert_eq!(PluginStatus::Success.as_word(), 0);
        assert_eq!(PluginStatus::PluginError.as_word(), 1);
        assert_eq!(PluginStatus::MarshalError.as_word(), -1);
    }

    #[tokio::test]
    async fn test_response_is_handed_to_the_guest() {
        let (mut sandbox, plugin, communicate) = forwarding_sandbox().await;

        let status = communicate
            .call_async(&mut sandbox.store, args(PROGRAM, INPUT, SLOTS))
            .await
            .unwrap();

        assert_eq!(status, 0);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
        let (ptr, len) = (read_u32(&sandbox, SLOTS[0]), read_u32(&sandbox, SLOTS[1]));
        assert_eq!(len, 8);
        let output = sandbox
            .marshaler
            .read_bytes(&sandbox.store, GuestPtr::new(ptr), len)
            .unwrap();
        assert_eq!(output, b"response");
        assert_eq!(read_u32(&sandbox, SLOTS[2]), 0);
        assert_eq!(read_u32(&sandbox, SLOTS[3]), 0);
        assert_eq!(sandbox.store.data().allocations, 0);
        assert_eq!(guest_live_allocations(&mut sandbox.store, &sandbox.instance).await, 1);
    }

    #[tokio::test]
    async fn test_unreadable_program_skips_the_plugin() {
        let (mut sandbox, plugin, communicate) = forwarding_sandbox().await;

        let status = communicate
            .call_async(
                &mut sandbox.store,
                args((OUT_OF_BOUNDS, PROGRAM.1), INPUT, SLOTS),
            )
            .await
            .unwrap();

        assert_eq!(status, -1);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
        assert_eq!(guest_live_allocations(&mut sandbox.store, &sandbox.instance).await, 0);
    }

    #[tokio::test]
    async fn test_unreadable_input_skips_the_plugin() {
        let (mut sandbox, plugin, communicate) = forwarding_sandbox().await;

        // Starts in bounds, ends past the last page.
        let status = communicate
            .call_async(&mut sandbox.store, args(PROGRAM, (65_530, 100), SLOTS))
            .await
            .unwrap();
        assert_eq!(status, -1);

        let status = communicate
            .call_async(
                &mut sandbox.store,
                args(PROGRAM, (OUT_OF_BOUNDS, INPUT.1), SLOTS),
            )
            .await
            .unwrap();
        assert_eq!(status, -1);

        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
        assert_eq!(guest_live_allocations(&mut sandbox.store, &sandbox.instance).await, 0);
    }

    #[tokio::test]
    async fn test_unwritable_slot_frees_the_response() {
        let (mut sandbox, plugin, communicate) = forwarding_sandbox().await;

        let slots = [OUT_OF_BOUNDS, SLOTS[1], SLOTS[2], SLOTS[3]];
        let status = communicate
            .call_async(&mut sandbox.store, args(PROGRAM, INPUT, slots))
            .await
            .unwrap();

        assert_eq!(status, -1);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sandbox.store.data().allocations, 0);
        assert_eq!(guest_live_allocations(&mut sandbox.store, &sandbox.instance).await, 0);
        // The addressable slots were cleared.
        for slot in &SLOTS[1..] {
            assert_eq!(read_u32(&sandbox, *slot), 0);
        }
    }
}
