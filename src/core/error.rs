use thiserror::Error;

use crate::core::path::FieldPath;

/// Failure of a clone operation. Every variant carries the chain of
/// field names, indices and map entry ordinals from the root, since the
/// failing node is otherwise unlocatable in a deep graph.
#[derive(Error, Debug)]
pub enum CloneError {
    /// No strategy could produce an unpopulated instance of the type.
    #[error("cannot allocate `{type_name}` at {path}: {reason}")]
    AllocationFailure {
        type_name: &'static str,
        path: FieldPath,
        reason: String,
    },
    /// A field could not be read or written under the active access
    /// mechanism.
    #[error("field access failed for `{type_name}` at {path}: {reason}")]
    FieldAccessFailure {
        type_name: &'static str,
        path: FieldPath,
        reason: String,
    },
    /// A registered user policy returned an error.
    #[error("user copy policy failed at {path}")]
    UserPolicyFailure {
        path: FieldPath,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The deadline or cancellation flag tripped mid-operation.
    #[error("clone operation aborted at {path}: {reason}")]
    OperationAborted { path: FieldPath, reason: String },
}
