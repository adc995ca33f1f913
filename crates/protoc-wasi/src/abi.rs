//! Names and conventions of the guest ABI.
//!
//! These are fixed by the protoc reactor build; changing any of them breaks
//! compatibility with existing `protoc.wasm` images.

/// Program name substituted for `argv[0]` when `run` is called with no arguments.
pub const DEFAULT_PROGRAM_NAME: &str = "protoc";

/// Linear memory export.
pub const EXPORT_MEMORY: &str = "memory";

/// Reactor initializer, called once after instantiation when present.
///
/// Signature: `_initialize()`
pub const EXPORT_INITIALIZE: &str = "_initialize";

/// Initializes the protoc reactor (creates the CLI and registers generators).
///
/// Signature: `protoc_init() -> i32`, 0 on success.
pub const EXPORT_PROTOC_INIT: &str = "protoc_init";

/// Runs protoc with an argument vector. `protoc_init` must have succeeded.
///
/// Signature: `protoc_run(argc: i32, argv: i32) -> i32`, protoc's exit code.
pub const EXPORT_PROTOC_RUN: &str = "protoc_run";

/// Tears the reactor down.
///
/// Signature: `protoc_destroy()`
pub const EXPORT_PROTOC_DESTROY: &str = "protoc_destroy";

/// Guest allocator.
///
/// Signature: `malloc(size: i32) -> i32`, 0 when out of memory.
pub const EXPORT_MALLOC: &str = "malloc";

/// Guest deallocator.
///
/// Signature: `free(ptr: i32)`
pub const EXPORT_FREE: &str = "free";

/// Import module providing host functions to the guest.
pub const IMPORT_MODULE: &str = "protoc";

/// Host function used by the guest to run a plugin subprocess.
///
/// Signature:
/// `plugin_communicate(program_ptr, program_len, search_path, input_ptr, input_len,
/// output_ptr_slot, output_len_slot, error_ptr_slot, error_len_slot) -> i32`
///
/// All slots receive 0 for "no value". See [`PluginStatus`](crate::PluginStatus)
/// for the return codes.
pub const IMPORT_PLUGIN_COMMUNICATE: &str = "plugin_communicate";
