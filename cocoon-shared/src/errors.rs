//! Error taxonomy for the guest supervisor.
//!
//! Every failure that can cross the host boundary is one of these kinds.
//! Each kind has a stable string code; the human-readable message may
//! change between releases, the code never does.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the workspace.
pub type CocoonResult<T> = Result<T, CocoonError>;

/// All error kinds produced by the guest supervisor.
#[derive(Debug, Error)]
pub enum CocoonError {
    #[error("a container with id {0} already exists")]
    ContainerExists(String),

    #[error("container {0} does not exist")]
    ContainerDoesNotExist(String),

    #[error("process {0} does not exist")]
    ProcessDoesNotExist(i32),

    #[error("a mapped virtual disk with lun {lun} is already attached to container {id}")]
    DuplicateMappedDiskLun { id: String, lun: u8 },

    #[error("a mapped directory with port {port} is already attached to container {id}")]
    DuplicateMappedDirectoryPort { id: String, port: u32 },

    #[error("request type {request_type} is not supported for resource type {resource_type}")]
    UnsupportedRequest {
        request_type: String,
        resource_type: String,
    },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("storage operation failed: {operation}: {cause}")]
    Storage { operation: String, cause: String },

    #[error("runtime operation failed: {operation}: {cause}")]
    Runtime { operation: String, cause: String },

    #[error("os operation failed: {operation}: {cause}")]
    Os { operation: String, cause: String },

    #[error("process {0} is not a tty and cannot be resized")]
    NotATerminal(i32),
}

impl CocoonError {
    /// Construct a storage error from an operation name and its cause.
    pub fn storage(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    /// Construct a runtime error from an operation name and its cause.
    pub fn runtime(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::Runtime {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    /// Construct an os error from an operation name and its cause.
    pub fn os(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::Os {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    /// Stable code identifying the error kind on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContainerExists(_) => "container_exists",
            Self::ContainerDoesNotExist(_) => "container_does_not_exist",
            Self::ProcessDoesNotExist(_) => "process_does_not_exist",
            Self::DuplicateMappedDiskLun { .. } => "duplicate_mapped_disk_lun",
            Self::DuplicateMappedDirectoryPort { .. } => "duplicate_mapped_directory_port",
            Self::UnsupportedRequest { .. } => "unsupported_request",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Storage { .. } => "storage_failure",
            Self::Runtime { .. } => "runtime_failure",
            Self::Os { .. } => "os_failure",
            Self::NotATerminal(_) => "not_a_terminal",
        }
    }
}

impl From<std::io::Error> for CocoonError {
    fn from(err: std::io::Error) -> Self {
        CocoonError::os("io", err)
    }
}

/// Serialized form of an error as it crosses the host boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl From<&CocoonError> for WireError {
    fn from(err: &CocoonError) -> Self {
        WireError {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
