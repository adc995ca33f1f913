//! Build script for the protoc-wasi crate.
//!
//! When the `embedded` feature is enabled, this embeds `protoc.wasm` into the
//! binary so callers don't need to ship the module separately.
//!
//! The `protoc.wasm` file is located by checking (in order):
//! 1. `PROTOC_WASM` env var (explicit path)
//! 2. `protoc.wasm` next to this crate's manifest (dev workflow)

// Build scripts should panic on errors, so expect/unwrap are appropriate here.
#![allow(clippy::expect_used, clippy::unwrap_used)]

fn main() {
    #[cfg(feature = "embedded")]
    embedded_module::prepare();
}

#[cfg(feature = "embedded")]
mod embedded_module {
    use std::path::PathBuf;

    pub fn prepare() {
        let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR not set"));
        let manifest_dir =
            PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));

        println!("cargo::rerun-if-env-changed=PROTOC_WASM");
        println!("cargo::rerun-if-changed=protoc.wasm");

        // 1. Explicit env var
        let wasm_path = std::env::var("PROTOC_WASM")
            .ok()
            .map(PathBuf::from)
            .filter(|p| p.exists());

        // 2. Crate directory
        let wasm_path =
            wasm_path.or_else(|| Some(manifest_dir.join("protoc.wasm")).filter(|p| p.exists()));

        match wasm_path {
            Some(path) => {
                let dest = out_dir.join("protoc.wasm");
                std::fs::copy(&path, &dest).expect("Failed to copy protoc.wasm");
            }
            None => {
                panic!(
                    "\n\
                    protoc.wasm not found.\n\
                    \n\
                    The `embedded` feature requires a WASI reactor build of protoc\n\
                    exporting protoc_init, protoc_run, protoc_destroy, malloc and free.\n\
                    \n\
                    Option 1: set an explicit path:\n\
                    \n\
                    $ export PROTOC_WASM=/path/to/protoc.wasm\n\
                    \n\
                    Option 2: place it next to the crate manifest:\n\
                    \n\
                    $ cp protoc.wasm crates/protoc-wasi/protoc.wasm\n\
                    "
                );
            }
        }
    }
}
