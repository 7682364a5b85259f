//! Error types for the Ore API client.
//!
//! # Design
//! `NotFound`, `Forbidden` and `Unauthenticated` get dedicated variants
//! because callers branch on them (a missing project, a missing permission,
//! a rejected API key). All other non-2xx responses land in `HttpError` with
//! the raw status code and body for debugging.
//!
//! Scheduling has its own, much smaller vocabulary: submitting to a halted
//! dispatcher fails synchronously with `DispatchError`, everything else a
//! task can go through is reported on its handle as a `TaskError`.

use crate::task::TaskError;
use crate::types::Permission;

/// Errors produced while talking to the remote service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The server returned 404.
    #[error("resource not found")]
    NotFound,

    /// The server returned 403; the session lacks a permission.
    #[error("missing permission for this endpoint")]
    Forbidden,

    /// No session could be created, or the server rejected it.
    #[error("could not authenticate: {0}")]
    Unauthenticated(String),

    /// The server returned a non-2xx status other than the ones above.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The request never produced a response.
    #[error("transport failed: {0}")]
    Transport(String),

    /// The response body could not be deserialized into the expected type.
    #[error("deserialization failed: {0}")]
    DeserializationError(String),

    /// The request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    SerializationError(String),

    /// A permission grant did not cover what the caller required.
    #[error(transparent)]
    MissingPermissions(#[from] MissingPermissions),
}

/// Permissions a session was found to lack.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing permission: {}", join(.0))]
pub struct MissingPermissions(pub Vec<Permission>);

fn join(permissions: &[Permission]) -> String {
    permissions
        .iter()
        .map(|permission| permission.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised synchronously when submitting work.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("the dispatcher has been halted")]
    Halted,

    #[error("failed to spawn dispatcher thread")]
    Spawn(#[from] std::io::Error),
}

/// Outcome error of a task submitted through the facade.
pub type ApiTaskError = TaskError<ApiError>;
