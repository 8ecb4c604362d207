use std::fmt;

use thiserror::Error;

use crate::data::{DataKind, ScalarType};

pub type Result<T> = std::result::Result<T, PypeError>;

#[derive(Debug, Error)]
pub enum PypeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operator '{0}' has not been fitted")]
    UnfittedOperator(String),

    #[error("Schema validation failed: {0}")]
    SchemaValidation(SchemaViolation),

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Key '{0}' not found in DataSet")]
    KeyNotFound(String),

    #[error("Length mismatch: {keys} key(s) but {values} value(s)")]
    LengthMismatch { keys: usize, values: usize },

    #[error("Operator '{operator}' failed: {message}")]
    Operator { operator: String, message: String },

    #[error("Metric gate '{label}' failed: {message}")]
    GateFailed { label: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PypeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedType(msg.into())
    }

    pub fn operator(operator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operator {
            operator: operator.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::SchemaValidation(SchemaViolation::MissingField {
            field: field.into(),
        })
    }

    pub fn type_mismatch(
        field: impl Into<String>,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Self::SchemaValidation(SchemaViolation::TypeMismatch {
            field: field.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }

    pub fn unexpected_field(field: impl Into<String>) -> Self {
        Self::SchemaValidation(SchemaViolation::UnexpectedField {
            field: field.into(),
        })
    }

    pub fn kind_mismatch(field: impl Into<String>, expected: DataKind, actual: DataKind) -> Self {
        Self::type_mismatch(field, expected, actual)
    }

    pub fn scalar_mismatch(field: impl Into<String>, expected: ScalarType, actual: ScalarType) -> Self {
        Self::type_mismatch(field, expected, actual)
    }

    pub fn is_schema_violation(&self) -> bool {
        matches!(self, Self::SchemaValidation(_))
    }
}

/// What a type checker rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    MissingField {
        field: String,
    },
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },
    UnexpectedField {
        field: String,
    },
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "`{field}` is missing"),
            Self::TypeMismatch {
                field,
                expected,
                actual,
            } => write!(
                f,
                "types did not match for `{field}`: expected {expected}, got {actual}"
            ),
            Self::UnexpectedField { field } => write!(f, "`{field}` is not part of the schema"),
        }
    }
}
