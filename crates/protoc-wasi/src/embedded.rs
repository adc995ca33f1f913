//! The `protoc.wasm` image compiled into the library.
//!
//! Enabled by the `embedded` feature. The image is located at build time, see
//! the crate's `build.rs`.
//!
//! # Example
//!
//! ```rust,ignore
//! use protoc_wasi::{Protoc, ProtocConfig, ProtocModule};
//!
//! let module = ProtocModule::embedded()?;
//! let protoc = Protoc::new(&module, ProtocConfig::new().with_inherited_stdio()).await?;
//! protoc.init().await?;
//! protoc.run(&["protoc", "--version"]).await?;
//! ```

use std::sync::OnceLock;

use crate::error::Error;
use crate::module::ProtocModule;

/// The embedded module image.
pub const PROTOC_WASM: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/protoc.wasm"));

impl ProtocModule {
    /// The embedded module, compiled on first use.
    ///
    /// Compilation happens once per process; later calls return a clone of
    /// the same module.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedded image fails to compile.
    pub fn embedded() -> Result<Self, Error> {
        static MODULE: OnceLock<Result<ProtocModule, String>> = OnceLock::new();

        MODULE
            .get_or_init(|| {
                tracing::debug!(bytes = PROTOC_WASM.len(), "Compiling embedded protoc.wasm");
                Self::from_binary(PROTOC_WASM).map_err(|e| e.to_string())
            })
            .clone()
            .map_err(Error::WasmModule)
    }
}
