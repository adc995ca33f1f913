//! Run a WASI build of protoc from the command line.
//!
//! Stdio is inherited and the exit code is protoc's own. Plugins named on the
//! command line run as native processes.
//!
//! # Examples
//!
//! ```bash
//! # Print the embedded compiler's version
//! protoc-wasi --wasm protoc.wasm -- --version
//!
//! # Compile with the current directory mounted at /
//! protoc-wasi --wasm protoc.wasm -- -I/ --descriptor_set_out=/out.pb /api.proto
//!
//! # Read protos from ./proto (read-only), write generated code to ./gen
//! protoc-wasi --wasm protoc.wasm --mount ./proto:/proto:ro --mount ./gen:/gen \
//!   -- -I/proto --go_out=/gen /proto/api.proto
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use protoc_wasi::abi::DEFAULT_PROGRAM_NAME;
use protoc_wasi::{CancellationToken, Mount, Protoc, ProtocConfig, ProtocModule};

/// Run protoc.wasm in-process with native plugin support.
#[derive(Parser, Debug)]
#[command(name = "protoc-wasi")]
#[command(version, about, long_about = None)]
struct Args {
    /// protoc.wasm to load
    ///
    /// Defaults to the PROTOC_WASM environment variable, or the embedded
    /// module when built with the `embedded` feature.
    #[arg(long, value_name = "PATH")]
    wasm: Option<PathBuf>,

    /// Directory to expose to protoc, as HOST[:GUEST][:ro]
    ///
    /// GUEST defaults to `/`. Can be specified multiple times. Without any
    /// mount, the current directory is mounted read-write at `/`.
    #[arg(long = "mount", value_name = "SPEC", value_parser = parse_mount)]
    mounts: Vec<Mount>,

    /// Abort protoc after this many seconds
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Arguments passed to protoc
    #[arg(last = true)]
    protoc_args: Vec<String>,
}

/// Parse `HOST[:GUEST][:ro]`.
fn parse_mount(spec: &str) -> Result<Mount> {
    let mut parts: Vec<&str> = spec.split(':').collect();
    let read_only = parts.len() > 1 && parts.last() == Some(&"ro");
    if read_only {
        parts.pop();
    }
    let (host, guest) = match parts.as_slice() {
        [host] => (*host, "/"),
        [host, guest] => (*host, *guest),
        _ => bail!("expected HOST[:GUEST][:ro], got {spec:?}"),
    };
    if host.is_empty() || guest.is_empty() {
        bail!("empty path in mount {spec:?}");
    }
    Ok(Mount {
        host: PathBuf::from(host),
        guest: guest.to_string(),
        read_only,
    })
}

fn load_module(wasm: Option<PathBuf>) -> Result<ProtocModule> {
    let path = wasm.or_else(|| std::env::var_os("PROTOC_WASM").map(PathBuf::from));
    match path {
        Some(path) => ProtocModule::from_file(&path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => embedded_module(),
    }
}

#[cfg(feature = "embedded")]
fn embedded_module() -> Result<ProtocModule> {
    ProtocModule::embedded().context("Failed to compile the embedded protoc.wasm")
}

#[cfg(not(feature = "embedded"))]
fn embedded_module() -> Result<ProtocModule> {
    bail!("no protoc.wasm given: pass --wasm or set PROTOC_WASM")
}

/// Map protoc's exit status onto a process exit status byte.
///
/// Anything outside `0..=255` is reported as 255 so failures never read as success.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(u8::MAX)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.verbose {
        "protoc_wasi=debug,protoc_wasi_cli=debug"
    } else {
        "protoc_wasi=warn,protoc_wasi_cli=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let module = load_module(args.wasm)?;

    let mut config = ProtocConfig::new().with_inherited_stdio();
    let mounts = if args.mounts.is_empty() {
        vec![Mount::new(".", "/")]
    } else {
        args.mounts
    };
    for mount in mounts {
        config = config.with_mount(mount);
    }
    if let Some(seconds) = args.timeout {
        config = config.with_run_timeout(Duration::from_secs(seconds));
    }

    let protoc = Protoc::new(&module, config)
        .await
        .context("Failed to instantiate protoc")?;
    protoc.init().await.context("Failed to initialize protoc")?;

    let mut argv = Vec::with_capacity(args.protoc_args.len() + 1);
    argv.push(DEFAULT_PROGRAM_NAME.to_string());
    argv.extend(args.protoc_args);

    // Ctrl-C interrupts the guest and kills any running plugin.
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted");
                cancel.cancel();
            }
        })
    };

    let result = protoc.run_with_cancel(&argv, cancel).await;
    ctrl_c.abort();
    protoc.destroy().await;

    let code = result.context("protoc did not complete")?;
    tracing::debug!(exit_code = code, "protoc finished");
    Ok(ExitCode::from(exit_status(code)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount_host_only() {
        let mount = parse_mount("./proto").unwrap();
        assert_eq!(mount, Mount::new("./proto", "/"));
    }

    #[test]
    fn test_parse_mount_with_guest_and_ro() {
        let mount = parse_mount("./proto:/proto:ro").unwrap();
        assert_eq!(mount, Mount::read_only("./proto", "/proto"));

        let mount = parse_mount("./gen:/gen").unwrap();
        assert_eq!(mount, Mount::new("./gen", "/gen"));

        let mount = parse_mount("./proto:ro").unwrap();
        assert_eq!(mount, Mount::read_only("./proto", "/"));
    }

    #[test]
    fn test_parse_mount_rejects_garbage() {
        assert!(parse_mount("a:b:c:d").is_err());
        assert!(parse_mount(":/guest").is_err());
    }

    #[test]
    fn test_exit_status_range() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(1), 1);
        assert_eq!(exit_status(-1), 255);
        assert_eq!(exit_status(300), 255);
    }

    #[test]
    fn test_args_split_at_double_dash() {
        let args = Args::try_parse_from([
            "protoc-wasi",
            "--wasm",
            "protoc.wasm",
            "--mount",
            "./proto:/proto:ro",
            "--",
            "--version",
        ])
        .unwrap();
        assert_eq!(args.wasm, Some(PathBuf::from("protoc.wasm")));
        assert_eq!(args.mounts.len(), 1);
        assert_eq!(args.protoc_args, vec!["--version".to_string()]);
    }
}
