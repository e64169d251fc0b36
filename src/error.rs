// Error taxonomy for the resolver core (spec §7).
//
// Every subsystem gets its own error enum; `DresError` wraps them at
// the crate boundary and exposes the signed status-code convention
// (`code()`) that the public `update_goal` API surfaces to callers.

use thiserror::Error;

use crate::graph::GraphError;
use crate::serializer::SerializeError;
use crate::vm::VmError;

/// libc-style error codes used by the status-code convention of spec §6.
/// Positive VM error codes and negated handler codes share this space.
pub mod codes {
    pub const EINVAL: i32 = 22;
    pub const ENOENT: i32 = 2;
    pub const EEXIST: i32 = 17;
    pub const ENOMEM: i32 = 12;
}

#[derive(Debug, Error)]
pub enum DresError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: u32, message: String },

    #[error("compile error in target {target}: {message}")]
    Compile { target: String, message: String },

    #[error("VM error: {0}")]
    Vm(#[from] VmError),

    #[error("handler error (code {0})")]
    Handler(i32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("policy error: {0}")]
    Policy(String),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("serialization error: {0}")]
    Serialize(#[from] SerializeError),
}

impl DresError {
    /// The signed status code this error corresponds to, per spec §6:
    /// positive for internal VM errors, negative for handler-originated
    /// failures, `EINVAL`-family constants for everything else.
    pub fn code(&self) -> i32 {
        match self {
            DresError::Parse { .. } => codes::EINVAL,
            DresError::Compile { .. } => codes::EINVAL,
            DresError::Vm(e) => e.code(),
            DresError::Handler(code) => -code.abs(),
            DresError::Io(_) => codes::ENOENT,
            DresError::Policy(_) => codes::EINVAL,
            DresError::Graph(_) => codes::EINVAL,
            DresError::Serialize(_) => codes::EINVAL,
        }
    }
}

pub type DresResult<T> = std::result::Result<T, DresError>;
