//! # protoc-wasi
//!
//! Run the Protocol Buffers compiler in-process from a WASI reactor build of
//! `protoc`, instead of spawning it as a subprocess.
//!
//! The guest runs inside wasmtime with its own linear memory. The host copies
//! arguments in, calls the guest's lifecycle exports, and serves the guest's
//! requests to run code generator plugins as native processes:
//!
//! - **Reactor lifecycle** - `init` once, `run` any number of times, `destroy`
//! - **No leaks across the boundary** - every host allocation in guest memory
//!   is freed or handed over, and the count is observable
//! - **Native plugins** - `--go_out` and friends work through a pluggable
//!   [`PluginHandler`]
//! - **Deadlines and cancellation** - runaway runs are interrupted via wasmtime
//!   epochs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use protoc_wasi::{Mount, Protoc, ProtocConfig, ProtocModule};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), protoc_wasi::Error> {
//!     // Compile once, instantiate as often as needed.
//!     let module = ProtocModule::from_file("protoc.wasm")?;
//!
//!     let config = ProtocConfig::new()
//!         .with_inherited_stdio()
//!         .with_mount(Mount::new(".", "/"));
//!     let protoc = Protoc::new(&module, config).await?;
//!
//!     protoc.init().await?;
//!     let code = protoc
//!         .run(&["protoc", "-I/", "--descriptor_set_out=/out.pb", "/api.proto"])
//!         .await?;
//!     protoc.destroy().await;
//!
//!     std::process::exit(code);
//! }
//! ```

#![forbid(unsafe_code)]

pub mod abi;
mod config;
#[cfg(feature = "embedded")]
pub mod embedded;
mod error;
mod gateway;
mod memory;
mod module;
mod plugin;
mod protoc;
mod state;
#[cfg(test)]
mod test_support;

pub use config::{
    CapturedOutput, DEFAULT_CAPTURE_CAPACITY, InputSource, Mount, OutputSink, ProtocConfig,
};
pub use error::Error;
pub use gateway::PluginStatus;
pub use memory::{Allocation, GuestPtr};
pub use module::ProtocModule;
pub use plugin::{
    CommandPluginHandler, PluginError, PluginFn, PluginHandler, PluginRegistry, PluginRequest,
};
pub use protoc::Protoc;
pub use state::LifecycleState;

// Re-export for `run_with_cancel` and custom plugin handlers.
pub use tokio_util::sync::CancellationToken;
