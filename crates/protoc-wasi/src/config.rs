//! Configuration for protoc instances.
//!
//! A [`ProtocConfig`] decides what the guest sees: its stdio, the host
//! directories mounted into its file system, its environment, how plugins are
//! run, and how long and how much memory a run may use.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wasmtime::{StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::error::Error;
use crate::plugin::{CommandPluginHandler, PluginHandler};

/// Default capacity of a [`CapturedOutput`] buffer (64 MiB).
pub const DEFAULT_CAPTURE_CAPACITY: usize = 64 * 1024 * 1024;

/// Where the guest's stdin comes from.
#[derive(Debug, Clone, Default)]
pub enum InputSource {
    /// Reads see end-of-file immediately.
    #[default]
    Empty,
    /// The host process's stdin.
    Inherit,
    /// A fixed buffer.
    Bytes(Vec<u8>),
}

/// Where one of the guest's output streams goes.
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Output is dropped.
    #[default]
    Discard,
    /// The host process's corresponding stream.
    Inherit,
    /// An in-memory buffer readable by the host.
    Capture(CapturedOutput),
}

/// In-memory buffer for a guest output stream.
///
/// Clones share the same buffer, so keep one and hand another to the config:
///
/// ```
/// use protoc_wasi::{CapturedOutput, OutputSink, ProtocConfig};
///
/// let stdout = CapturedOutput::new();
/// let config = ProtocConfig::new().with_stdout(OutputSink::Capture(stdout.clone()));
/// # let _ = config;
/// assert!(stdout.contents().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pipe: MemoryOutputPipe,
}

impl Default for CapturedOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl CapturedOutput {
    /// Create a buffer holding up to [`DEFAULT_CAPTURE_CAPACITY`] bytes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPTURE_CAPACITY)
    }

    /// Create a buffer holding up to `capacity` bytes. Guest writes past the
    /// capacity fail.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pipe: MemoryOutputPipe::new(capacity),
        }
    }

    /// Everything written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.pipe.contents().to_vec()
    }

    /// Everything written so far, decoded lossily as UTF-8.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.pipe.contents()).into_owned()
    }
}

/// A host directory exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Directory on the host.
    pub host: PathBuf,
    /// Path the guest sees, e.g. `/` or `/out`.
    pub guest: String,
    /// Deny writes from the guest.
    pub read_only: bool,
}

impl Mount {
    /// A read-write mount.
    #[must_use]
    pub fn new(host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            read_only: false,
        }
    }

    /// A read-only mount.
    #[must_use]
    pub fn read_only(host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::new(host, guest)
        }
    }
}

/// Configuration for a [`Protoc`](crate::Protoc) instance.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use protoc_wasi::{Mount, ProtocConfig};
///
/// let config = ProtocConfig::new()
///     .with_mount(Mount::read_only("./proto", "/proto"))
///     .with_mount(Mount::new("./gen", "/gen"))
///     .with_run_timeout(Duration::from_secs(30));
/// # let _ = config;
/// ```
#[derive(Clone)]
pub struct ProtocConfig {
    pub(crate) stdin: InputSource,
    pub(crate) stdout: OutputSink,
    pub(crate) stderr: OutputSink,
    pub(crate) mounts: Vec<Mount>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) plugin_handler: Arc<dyn PluginHandler>,
    pub(crate) run_timeout: Option<Duration>,
    pub(crate) max_memory_bytes: Option<usize>,
}

impl std::fmt::Debug for ProtocConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocConfig")
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("mounts", &self.mounts)
            .field("env", &self.env)
            .field("plugin_handler", &"<dyn PluginHandler>")
            .field("run_timeout", &self.run_timeout)
            .field("max_memory_bytes", &self.max_memory_bytes)
            .finish()
    }
}

impl Default for ProtocConfig {
    fn default() -> Self {
        Self {
            stdin: InputSource::default(),
            stdout: OutputSink::default(),
            stderr: OutputSink::default(),
            mounts: Vec::new(),
            env: Vec::new(),
            plugin_handler: Arc::new(CommandPluginHandler::new()),
            run_timeout: None,
            max_memory_bytes: None,
        }
    }
}

impl ProtocConfig {
    /// No stdio, no mounts, native plugin subprocesses, no limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guest's stdin.
    #[must_use]
    pub fn with_stdin(mut self, stdin: InputSource) -> Self {
        self.stdin = stdin;
        self
    }

    /// Set the guest's stdout.
    #[must_use]
    pub fn with_stdout(mut self, stdout: OutputSink) -> Self {
        self.stdout = stdout;
        self
    }

    /// Set the guest's stderr.
    #[must_use]
    pub fn with_stderr(mut self, stderr: OutputSink) -> Self {
        self.stderr = stderr;
        self
    }

    /// Inherit stdin, stdout and stderr from the host process.
    #[must_use]
    pub fn with_inherited_stdio(self) -> Self {
        self.with_stdin(InputSource::Inherit)
            .with_stdout(OutputSink::Inherit)
            .with_stderr(OutputSink::Inherit)
    }

    /// Expose a host directory to the guest.
    #[must_use]
    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Set an environment variable in the guest.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run plugins with `handler` instead of native subprocesses.
    #[must_use]
    pub fn with_plugin_handler(mut self, handler: impl PluginHandler + 'static) -> Self {
        self.plugin_handler = Arc::new(handler);
        self
    }

    /// Fail runs that take longer than `timeout`.
    ///
    /// A run that hits the deadline returns
    /// [`Error::RunFailed`] and leaves the instance faulted.
    #[must_use]
    pub const fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Cap the guest's linear memory at `bytes`.
    #[must_use]
    pub const fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Build the WASI preview1 context for a new instance.
    pub(crate) fn build_wasi(&self) -> Result<WasiP1Ctx, Error> {
        let mut builder = WasiCtxBuilder::new();

        match &self.stdin {
            InputSource::Empty => {}
            InputSource::Inherit => {
                builder.inherit_stdin();
            }
            InputSource::Bytes(bytes) => {
                builder.stdin(MemoryInputPipe::new(bytes.clone()));
            }
        }
        match &self.stdout {
            OutputSink::Discard => {}
            OutputSink::Inherit => {
                builder.inherit_stdout();
            }
            OutputSink::Capture(captured) => {
                builder.stdout(captured.pipe.clone());
            }
        }
        match &self.stderr {
            OutputSink::Discard => {}
            OutputSink::Inherit => {
                builder.inherit_stderr();
            }
            OutputSink::Capture(captured) => {
                builder.stderr(captured.pipe.clone());
            }
        }

        for (key, value) in &self.env {
            builder.env(key, value);
        }

        for mount in &self.mounts {
            let (dir_perms, file_perms) = if mount.read_only {
                (DirPerms::READ, FilePerms::READ)
            } else {
                (DirPerms::all(), FilePerms::all())
            };
            builder
                .preopened_dir(&mount.host, &mount.guest, dir_perms, file_perms)
                .map_err(|e| Error::Mount {
                    host: mount.host.display().to_string(),
                    guest: mount.guest.clone(),
                    reason: format!("{e:#}"),
                })?;
            tracing::debug!(
                host = %mount.host.display(),
                guest = %mount.guest,
                read_only = mount.read_only,
                "Mounted directory"
            );
        }

        Ok(builder.build_p1())
    }

    /// Build the store limits for a new instance.
    pub(crate) fn build_limits(&self) -> StoreLimits {
        let mut limits = StoreLimitsBuilder::new();
        if let Some(bytes) = self.max_memory_bytes {
            limits = limits.memory_size(bytes);
        }
        limits.build()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProtocConfig::new();
        assert!(matches!(config.stdin, InputSource::Empty));
        assert!(matches!(config.stdout, OutputSink::Discard));
        assert!(config.mounts.is_empty());
        assert!(config.run_timeout.is_none());
        config.build_wasi().unwrap();
    }

    #[test]
    fn test_mount_constructors() {
        let mount = Mount::read_only("/tmp", "/proto");
        assert!(mount.read_only);
        assert_eq!(mount.guest, "/proto");
        assert!(!Mount::new("/tmp", "/").read_only);
    }

    #[test]
    fn test_missing_mount_is_rejected() {
        let config = ProtocConfig::new().with_mount(Mount::new("/nonexistent/protoc-wasi", "/"));
        let Err(err) = config.build_wasi() else {
            panic!("expected Mount error, got Ok");
        };
        match err {
            Error::Mount { host, guest, .. } => {
                assert_eq!(host, "/nonexistent/protoc-wasi");
                assert_eq!(guest, "/");
            }
            other => panic!("expected Mount error, got {other:?}"),
        }
    }

    #[test]
    fn test_existing_mount_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProtocConfig::new()
            .with_mount(Mount::read_only(dir.path(), "/in"))
            .with_env("PROTOC_WASI_TEST", "1");
        config.build_wasi().unwrap();
    }

    #[test]
    fn test_captured_output_starts_empty() {
        let captured = CapturedOutput::with_capacity(16);
        assert!(captured.contents().is_empty());
        assert_eq!(captured.to_string_lossy(), "");
    }

    #[test]
    fn test_debug_hides_handler() {
        let debug = format!("{:?}", ProtocConfig::new().with_max_memory(1 << 20));
        assert!(debug.contains("<dyn PluginHandler>"));
        assert!(debug.contains("1048576"));
    }
}
