//! Error types and result definitions for the Opal runtime.
//!
//! Only language-level errors live here: the failures a program can observe
//! through normal property-access semantics (TypeError, RangeError,
//! ReferenceError equivalents). Internal invariant violations in the engine
//! are not representable as values of this type; they abort via `panic!`.

use thiserror::Error;

/// The unified result type used throughout the runtime.
pub type EngineResult<T> = Result<T, EngineError>;

/// Language-level error raised by property access semantics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Operation applied to a value of the wrong type.
    #[error("TypeError: {message}")]
    TypeError {
        /// Error description.
        message: String,
    },

    /// Numeric value outside the legal range for the operation.
    #[error("RangeError: {message}")]
    RangeError {
        /// Error description.
        message: String,
    },

    /// Required binding or property does not exist.
    #[error("ReferenceError: {name} is not defined")]
    ReferenceError {
        /// The missing name.
        name: String,
    },
}

impl EngineError {
    /// TypeError for a property read/write on `undefined` or `null`.
    #[inline]
    pub fn nullish_receiver(op: &str, key: &str) -> Self {
        Self::TypeError {
            message: format!("cannot {op} property '{key}' of null or undefined"),
        }
    }

    /// TypeError for an assignment to a non-writable property.
    #[inline]
    pub fn read_only(key: &str) -> Self {
        Self::TypeError {
            message: format!("cannot assign to read-only property '{key}'"),
        }
    }

    /// TypeError for any operation on a revoked proxy.
    #[inline]
    pub fn revoked_proxy() -> Self {
        Self::TypeError {
            message: "cannot perform operation on a revoked proxy".to_string(),
        }
    }

    /// TypeError for an accessor property with no setter.
    #[inline]
    pub fn no_setter(key: &str) -> Self {
        Self::TypeError {
            message: format!("cannot set property '{key}' which has only a getter"),
        }
    }

    /// RangeError for an invalid array length assignment.
    #[inline]
    pub fn invalid_array_length() -> Self {
        Self::RangeError {
            message: "invalid array length".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::nullish_receiver("read", "x");
        assert_eq!(
            err.to_string(),
            "TypeError: cannot read property 'x' of null or undefined"
        );

        let err = EngineError::ReferenceError {
            name: "missing".to_string(),
        };
        assert_eq!(err.to_string(), "ReferenceError: missing is not defined");
    }

    #[test]
    fn test_error_constructors() {
        assert!(matches!(
            EngineError::read_only("x"),
            EngineError::TypeError { .. }
        ));
        assert!(matches!(
            EngineError::invalid_array_length(),
            EngineError::RangeError { .. }
        ));
    }
}
