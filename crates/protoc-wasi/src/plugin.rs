//! Plugin subprocess strategies.
//!
//! When protoc needs a code generator plugin (`--go_out`, `--plugin=...`), the
//! guest cannot spawn processes itself. It hands the serialized
//! `CodeGeneratorRequest` to the host, which runs the plugin through a
//! [`PluginHandler`] and returns the serialized `CodeGeneratorResponse`.
//!
//! Two strategies are provided:
//!
//! - [`CommandPluginHandler`] spawns the plugin as a native child process
//!   (the default).
//! - [`PluginRegistry`] serves named plugins from in-process closures, with an
//!   optional fallback handler for everything else.

use std::collections::HashMap;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// A single plugin exchange requested by the guest.
#[derive(Debug, Clone, Copy)]
pub struct PluginRequest<'a> {
    /// Plugin program name, e.g. `protoc-gen-go`.
    pub program: &'a str,
    /// Whether `program` should be looked up on `PATH`.
    pub search_path: bool,
    /// Serialized request to write to the plugin's stdin.
    pub input: &'a [u8],
}

/// Errors produced by a plugin exchange.
///
/// The `Display` text is what the guest sees as the plugin error message.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The plugin program does not exist.
    #[error("{program}: program not found")]
    NotFound {
        /// Plugin program name.
        program: String,
    },

    /// The plugin could not be started.
    #[error("{program}: failed to start: {source}")]
    Spawn {
        /// Plugin program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Reading from or writing to the plugin failed.
    #[error("{program}: {source}")]
    Io {
        /// Plugin program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The plugin exited unsuccessfully.
    #[error("{program}: {status}{}", stderr_suffix(.stderr))]
    Exited {
        /// Plugin program name.
        program: String,
        /// Exit status.
        status: ExitStatus,
        /// Captured stderr, trimmed.
        stderr: String,
    },

    /// The surrounding run was cancelled while the plugin was running.
    #[error("{program}: cancelled")]
    Cancelled {
        /// Plugin program name.
        program: String,
    },

    /// Any other failure, typically from a custom handler.
    #[error("{0}")]
    Other(String),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// Strategy for running a plugin on behalf of the guest.
///
/// Implementations must honour `cancel`: once it fires the exchange should stop
/// promptly and return [`PluginError::Cancelled`].
#[async_trait]
pub trait PluginHandler: Send + Sync {
    /// Send `request.input` to the plugin and return its output.
    async fn communicate(
        &self,
        request: PluginRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, PluginError>;
}

/// Runs plugins as native child processes over stdin/stdout.
///
/// With `search_path` the program is resolved through `PATH`; otherwise a bare
/// name is resolved relative to the current directory, like `execv`.
#[derive(Debug, Clone, Default)]
pub struct CommandPluginHandler {
    working_dir: Option<PathBuf>,
}

impl CommandPluginHandler {
    /// Create a handler that runs plugins in the current directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run plugins with `dir` as their working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn resolve(program: &str, search_path: bool) -> PathBuf {
        if search_path || program.contains(MAIN_SEPARATOR) || program.contains('/') {
            PathBuf::from(program)
        } else {
            Path::new(".").join(program)
        }
    }
}

#[async_trait]
impl PluginHandler for CommandPluginHandler {
    async fn communicate(
        &self,
        request: PluginRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, PluginError> {
        let program = request.program.to_string();
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled { program });
        }

        let mut command = Command::new(Self::resolve(&program, request.search_path));
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                PluginError::NotFound {
                    program: program.clone(),
                }
            } else {
                PluginError::Spawn {
                    program: program.clone(),
                    source,
                }
            }
        })?;
        tracing::debug!(
            program = %program,
            pid = ?child.id(),
            input_len = request.input.len(),
            "Spawned plugin"
        );

        let mut stdin = child.stdin.take().ok_or_else(|| {
            PluginError::Other(format!("{program}: stdin was not captured"))
        })?;
        let input = request.input.to_vec();

        // Feed stdin while draining stdout/stderr so large payloads can't
        // deadlock on full pipes. Dropping this future kills the child.
        let exchange = async move {
            let feed = async move {
                stdin.write_all(&input).await?;
                stdin.shutdown().await
            };
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            // A plugin may exit without reading all of its input.
            if let Err(e) = fed
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(e);
            }
            output
        };

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(program = %program, "Plugin cancelled");
                return Err(PluginError::Cancelled { program });
            }
            output = exchange => output.map_err(|source| PluginError::Io {
                program: program.clone(),
                source,
            })?,
        };

        if !output.status.success() {
            return Err(PluginError::Exited {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(
            program = %program,
            output_len = output.stdout.len(),
            "Plugin finished"
        );
        Ok(output.stdout)
    }
}

/// An in-process plugin: serialized request in, serialized response out.
pub type PluginFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Serves plugins from in-process functions keyed by program name.
///
/// Useful for tests and for generators compiled into the host. Programs that
/// are not registered go to the fallback handler, or fail with
/// [`PluginError::NotFound`] when there is none.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, PluginFn>,
    fallback: Option<Arc<dyn PluginHandler>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("PluginRegistry")
            .field("plugins", &names)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry with no fallback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin` under `program`.
    #[must_use]
    pub fn with_plugin<F>(mut self, program: impl Into<String>, plugin: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.plugins.insert(program.into(), Arc::new(plugin));
        self
    }

    /// Send unregistered programs to `handler`.
    #[must_use]
    pub fn with_fallback(mut self, handler: impl PluginHandler + 'static) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }
}

#[async_trait]
impl PluginHandler for PluginRegistry {
    async fn communicate(
        &self,
        request: PluginRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, PluginError> {
        if let Some(plugin) = self.plugins.get(request.program) {
            if cancel.is_cancelled() {
                return Err(PluginError::Cancelled {
                    program: request.program.to_string(),
                });
            }
            return plugin(request.input)
                .map_err(|message| PluginError::Other(format!("{}: {message}", request.program)));
        }
        match &self.fallback {
            Some(fallback) => fallback.communicate(request, cancel).await,
            None => Err(PluginError::NotFound {
                program: request.program.to_string(),
            }),
        }
    }
}
