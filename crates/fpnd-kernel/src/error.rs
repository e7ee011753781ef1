//! Kernel-specific error types.

use fpnd_types::error::{FpndError, FpndResult};
use thiserror::Error;

/// Step of the startup sequence an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    AdhocJoin,
    FirstCycle,
    Orbit,
}

impl std::fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdhocJoin => write!(f, "ad-hoc join"),
            Self::FirstCycle => write!(f, "first cycle"),
            Self::Orbit => write!(f, "orbit"),
        }
    }
}

/// Kernel error type wrapping FpndError with kernel-specific context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped FpndError.
    #[error(transparent)]
    Fpnd(#[from] FpndError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),

    /// Startup stopped at `phase`.
    #[error("Startup failed during {phase}: {source}")]
    Startup {
        phase: StartupPhase,
        source: FpndError,
    },
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;

/// Attach a startup phase to a component result.
pub(crate) fn in_phase<T>(phase: StartupPhase, result: FpndResult<T>) -> KernelResult<T> {
    result.map_err(|source| KernelError::Startup { phase, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_startup_error_names_phase_and_keeps_source() {
        let err = in_phase::<()>(StartupPhase::FirstCycle, Err(FpndError::CycleInFlight))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Startup failed during first cycle: Reconciliation cycle already in flight"
        );
        assert!(err.source().is_some());
    }
}
