//! Event definitions for the service supervisor loop.
//!
//! This module defines the `Event` enum which carries everything that drives a
//! foreground stack run: service lifecycle updates, output lines and OS
//! signals received by the runner.

use crate::output::StreamKind;

/// Represents an event in the supervisor's main loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A service is about to start.
    ServiceStarting { id: usize },
    /// A service has been spawned.
    ServiceStarted { id: usize, pid: u32 },
    /// A service has passed its readiness check.
    ServiceReady { id: usize },
    /// A service is waiting on its dependencies to become ready.
    ServiceWaiting { id: usize, deps: Vec<String> },
    /// A line of output (stdout or stderr) was received from a service.
    ServiceOutput {
        id: usize,
        line: String,
        stream: StreamKind,
    },
    /// A service exited with an optional exit code (None usually implies signal termination).
    ServiceExited { id: usize, code: Option<i32> },
    /// A service failed to start or encountered an error.
    ServiceFailed { id: usize, error: String },
    /// A signal was sent to a service's process group.
    ServiceSignal { id: usize, signal: ProcessSignal },
    /// A request to restart a service.
    Restart { id: usize },
    /// The runner itself received a termination signal.
    Shutdown { signal: ProcessSignal },
}

/// Signals the supervisor sends or receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    SigKill,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    pub fn as_raw(self) -> libc::c_int {
        match self {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigKill => libc::SIGKILL,
        }
    }
}
