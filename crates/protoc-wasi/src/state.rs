//! Lifecycle of a protoc instance.

use crate::error::Error;

/// Observable state of a [`Protoc`](crate::Protoc) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Instantiated, `init` not yet called (or it reported failure).
    Created,
    /// `init` succeeded; `run` is allowed.
    Initialized,
    /// A trap, deadline or cancellation left the guest in an unknown state.
    Faulted,
    /// Torn down. Terminal.
    Destroyed,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Faulted => "faulted",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// State machine guarding every dispatcher operation.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: LifecycleState,
    fault: Option<String>,
}

impl Lifecycle {
    pub(crate) const fn new() -> Self {
        Self {
            state: LifecycleState::Created,
            fault: None,
        }
    }

    pub(crate) const fn state(&self) -> LifecycleState {
        self.state
    }

    fn faulted(&self) -> Error {
        Error::InstanceFaulted(self.fault.clone().unwrap_or_default())
    }

    /// Check whether `init` may proceed.
    ///
    /// Returns `Ok(true)` when the instance is already initialized and the
    /// guest must not be called again.
    pub(crate) fn can_init(&self) -> Result<bool, Error> {
        match self.state {
            LifecycleState::Created => Ok(false),
            LifecycleState::Initialized => Ok(true),
            LifecycleState::Faulted => Err(self.faulted()),
            LifecycleState::Destroyed => Err(Error::Destroyed),
        }
    }

    /// Check whether `run` may proceed.
    pub(crate) fn can_run(&self) -> Result<(), Error> {
        match self.state {
            LifecycleState::Initialized => Ok(()),
            LifecycleState::Created => Err(Error::NotInitialized),
            LifecycleState::Faulted => Err(self.faulted()),
            LifecycleState::Destroyed => Err(Error::Destroyed),
        }
    }

    pub(crate) fn initialized(&mut self) {
        if self.state == LifecycleState::Created {
            self.state = LifecycleState::Initialized;
        }
    }

    /// Move to `Faulted`. Has no effect once destroyed.
    pub(crate) fn fault(&mut self, reason: String) {
        match self.state {
            LifecycleState::Created | LifecycleState::Initialized => {
                tracing::warn!(reason = %reason, "protoc instance faulted");
                self.state = LifecycleState::Faulted;
                self.fault = Some(reason);
            }
            LifecycleState::Faulted | LifecycleState::Destroyed => {}
        }
    }

    /// Move to `Destroyed`.
    ///
    /// Returns `None` if already destroyed, otherwise whether the guest
    /// destroy export should be called (only from `Initialized`).
    pub(crate) fn begin_destroy(&mut self) -> Option<bool> {
        let previous = std::mem::replace(&mut self.state, LifecycleState::Destroyed);
        match previous {
            LifecycleState::Destroyed => None,
            LifecycleState::Initialized => Some(true),
            LifecycleState::Created | LifecycleState::Faulted => Some(false),
        }
    }
}
