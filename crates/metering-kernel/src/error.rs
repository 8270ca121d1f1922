//! Error types for the metering kernel.
//!
//! Only configuration problems and invalid corridor indices are errors.
//! Sensor gaps and infeasible rate commands are absorbed where they occur.

use thiserror::Error;

/// Main error type for kernel construction and the tick loop.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A per-ramp table references a ramp missing from the geometry table.
    #[error("{section} references unknown ramp '{name}'")]
    UnknownRamp { section: &'static str, name: String },

    /// Two geometry entries share a name.
    #[error("duplicate ramp '{0}' in geometry table")]
    DuplicateRamp(String),

    /// A ramp has no meter configuration, so it cannot be actuated.
    #[error("ramp '{0}' has no meter configuration")]
    MissingMeter(String),

    /// Configuration values that are present but unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A ramp index outside the corridor registry.
    #[error("ramp index {index} out of bounds for corridor of {len} ramps")]
    RampOutOfBounds { index: usize, len: usize },

    /// A control period closed without a decision for every ramp.
    #[error("control period {period} has no decision for ramp index {index}")]
    MissingDecision { period: u64, index: usize },

    /// The external simulator boundary failed.
    #[error("environment error: {0}")]
    Environment(#[from] anyhow::Error),

    /// Reading a configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration document could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_ramp_names_section() {
        let err = KernelError::UnknownRamp {
            section: "meters",
            name: "Onramp99".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("meters"));
        assert!(msg.contains("Onramp99"));
    }

    #[test]
    fn test_environment_error_from_anyhow() {
        let err = KernelError::from(anyhow::anyhow!("simulator closed"));
        assert!(matches!(err, KernelError::Environment(_)));
        assert!(err.to_string().contains("simulator closed"));
    }

    #[test]
    fn test_out_of_bounds_message() {
        let err = KernelError::RampOutOfBounds { index: 14, len: 13 };
        assert_eq!(
            err.to_string(),
            "ramp index 14 out of bounds for corridor of 13 ramps"
        );
    }
}
