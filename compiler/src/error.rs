// error.rs — Fatal errors of a specialization run
//
// Any variant aborts the whole run: the pipeline returns it through `?` and
// no partial program is produced. Non-fatal conditions are diagnostics.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SpecializeError {
    /// The actor graph's configuration cannot be mapped onto storage
    /// (duplicate synthesized slot, missing slot).
    #[error("configuration error in {class}: {message}")]
    Configuration { class: String, message: String },

    /// Inputs that were assumed pre-validated are inconsistent with each
    /// other (schedule names an unknown actor, missing class or method,
    /// replacement lookup for an unregistered value).
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    /// Malformed textual IR or attribute expression.
    #[error("parse error: {0}")]
    Parse(String),

    /// Failure while interpreting a program (null receiver, empty
    /// receiver, step budget exhausted).
    #[error("execution error: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, SpecializeError>;

impl SpecializeError {
    pub fn configuration(class: impl Into<String>, message: impl Into<String>) -> Self {
        SpecializeError::Configuration {
            class: class.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SpecializeError::InternalConsistency(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        SpecializeError::Execution(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_display() {
        let e = SpecializeError::configuration("Gain", "duplicate field `_CGToken_a_b`");
        assert_eq!(
            e.to_string(),
            "configuration error in Gain: duplicate field `_CGToken_a_b`"
        );
    }

    #[test]
    fn internal_display() {
        let e = SpecializeError::internal("schedule references unknown actor `C`");
        assert_eq!(
            e.to_string(),
            "internal consistency error: schedule references unknown actor `C`"
        );
    }
}
