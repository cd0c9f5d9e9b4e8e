//! clawlink Error Types
//!
//! This module defines a layered error hierarchy:
//! - `DomainError`: configuration and settings failures
//! - `InfraError`: Infrastructure errors (IO, serialization)
//! - `ClawlinkError`: Top-level error that wraps both categories

use std::fmt;

/// Domain-level errors representing configuration failures
#[derive(Debug)]
pub enum DomainError {
    /// Configuration validation failed
    ConfigInvalid { field: String, reason: String },
    /// Configuration parsing failed
    ConfigParse { path: String, source: String },
    /// A workspace-scoped operation was requested without a workspace directory
    WorkspaceRequired { operation: String },
    /// Settings store operation failed
    Settings { operation: String, reason: String },
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigInvalid { field, reason } => {
                write!(f, "Config invalid [{}]: {}", field, reason)
            }
            Self::ConfigParse { path, source } => {
                write!(f, "Config parse error in {}: {}", path, source)
            }
            Self::WorkspaceRequired { operation } => {
                write!(f, "{} requires a workspace directory", operation)
            }
            Self::Settings { operation, reason } => {
                write!(f, "Settings {} failed: {}", operation, reason)
            }
        }
    }
}

impl std::error::Error for DomainError {}

/// Failures reading or writing settings, override and state files
#[derive(Debug)]
pub enum InfraError {
    Io(std::io::Error),
    /// Workspace override or gateway state file
    Json(serde_json::Error),
    /// Global settings file
    Yaml(serde_yml::Error),
}

impl fmt::Display for InfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "file access failed: {}", err),
            Self::Json(err) => write!(f, "invalid JSON: {}", err),
            Self::Yaml(err) => write!(f, "invalid YAML: {}", err),
        }
    }
}

impl std::error::Error for InfraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Yaml(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for InfraError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for InfraError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<serde_yml::Error> for InfraError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Yaml(err)
    }
}

/// Top-level error type for clawlink configuration and settings
///
/// Component crates keep their own error enums; this one covers everything
/// that touches the config model and its on-disk representations.
#[derive(Debug)]
pub enum ClawlinkError {
    Domain(DomainError),
    Infra(InfraError),
}

impl fmt::Display for ClawlinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(e) => write!(f, "{}", e),
            Self::Infra(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClawlinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Domain(e) => Some(e),
            Self::Infra(e) => Some(e),
        }
    }
}

impl From<DomainError> for ClawlinkError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

impl From<InfraError> for ClawlinkError {
    fn from(err: InfraError) -> Self {
        Self::Infra(err)
    }
}

// `?` on raw io/serde results
impl From<std::io::Error> for ClawlinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(err))
    }
}

impl From<serde_json::Error> for ClawlinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infra(InfraError::Json(err))
    }
}

impl From<serde_yml::Error> for ClawlinkError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Infra(InfraError::Yaml(err))
    }
}

impl ClawlinkError {
    /// Create a config parse error for the file at `path`
    pub fn config_parse_error(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigParse {
            path: path.into(),
            source: source.into(),
        })
    }

    /// Create a config validation error
    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        })
    }

    pub fn workspace_required(operation: impl Into<String>) -> Self {
        Self::Domain(DomainError::WorkspaceRequired {
            operation: operation.into(),
        })
    }

    pub fn settings_error(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::Settings {
            operation: operation.into(),
            reason: reason.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_display() {
        let err = ClawlinkError::config_invalid("url", "must start with ws:// or wss://");
        assert_eq!(
            err.to_string(),
            "Config invalid [url]: must start with ws:// or wss://"
        );

        let err = ClawlinkError::workspace_required("Workspace config update");
        assert_eq!(
            err.to_string(),
            "Workspace config update requires a workspace directory"
        );
    }

    #[test]
    fn test_io_error_converts_to_infra() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ClawlinkError = io.into();
        assert!(matches!(err, ClawlinkError::Infra(InfraError::Io(_))));
        assert!(std::error::Error::source(&err).is_some());
    }
}
