//! Readiness gate for logrelay
//!
//! Polls a dependency until it accepts connections, then hands the process
//! over to the target command.

mod gate;
mod handoff;
mod policy;
mod probe;

pub use gate::{GateError, GateReport, ReadinessGate};
pub use handoff::{exec_command, run_command};
pub use policy::{Backoff, RetryPolicy};
pub use probe::{probe_for, HttpProbe, Probe, ProbeError, TcpProbe, DEFAULT_PROBE_TIMEOUT};

// Re-export types used in our public API
pub use logrelay_types::{
    Credential, CredentialKind, CredentialRef, Endpoint, FailureClass, PollAttempt, PollOutcome,
    ProbeKind,
};
