//! Error types for the protoc bridge.

use crate::memory::GuestPtr;
use crate::plugin::PluginError;

/// Errors that can occur while loading or driving a protoc instance.
///
/// A non-zero protoc exit code is *not* an error: it is returned as the
/// `Ok` value of [`Protoc::run`](crate::Protoc::run).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The wasmtime engine or linker could not be configured.
    #[error("wasm engine error: {0}")]
    WasmEngine(String),

    /// The module image could not be compiled.
    #[error("failed to load wasm module: {0}")]
    WasmModule(String),

    /// The module could not be instantiated (missing imports, start trap, ...).
    #[error("failed to instantiate module: {0}")]
    Instantiation(String),

    /// A required export is missing or has the wrong signature.
    #[error("missing export: {name} ({reason})")]
    MissingExport {
        /// Export name from the guest ABI.
        name: &'static str,
        /// Why the lookup failed.
        reason: String,
    },

    /// A host directory could not be mounted into the guest.
    #[error("failed to mount {host} at {guest}: {reason}")]
    Mount {
        /// Host directory.
        host: String,
        /// Guest path.
        guest: String,
        /// Underlying failure.
        reason: String,
    },

    /// The guest allocator returned null, trapped, or the request was too large.
    #[error("guest allocation failed: {0}")]
    AllocationFailed(String),

    /// A read or write fell outside the guest's linear memory.
    #[error("guest memory access out of bounds: {len} bytes at {ptr}")]
    MemoryAccessFailed {
        /// Start of the access.
        ptr: GuestPtr,
        /// Number of bytes.
        len: usize,
    },

    /// `run` was called before a successful `init`.
    #[error("protoc not initialized, call init() first")]
    NotInitialized,

    /// The guest init export reported failure or trapped.
    #[error("protoc_init failed: {0}")]
    InitFailed(String),

    /// The guest run export could not complete (trap, deadline, cancellation).
    #[error("protoc_run failed: {0}")]
    RunFailed(String),

    /// The instance has been destroyed.
    #[error("protoc instance has been destroyed")]
    Destroyed,

    /// An earlier failure left the instance in an unknown state.
    #[error("protoc instance is faulted and cannot be reused: {0}")]
    InstanceFaulted(String),

    /// A plugin exchange failed.
    #[error("plugin communication failed: {0}")]
    PluginCommunicationFailed(#[from] PluginError),

    /// A host file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
