//! # Error Taxonomy
//!
//! One error type per failure domain. None of them is fatal: transport errors are
//! retried by the connection manager, group errors are retried lazily by the
//! registry, and mutation/query errors are surfaced to the caller.

use std::time::Duration;

use thiserror::Error;

use crate::core::events::{GroupOp, MutationKind, ResourceId};

/// Connection or negotiation failure on the push transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Connection closed before the invocation completed")]
    ConnectionClosed,

    #[error("Invocation of {method} failed: {message}")]
    Invocation { method: String, message: String },

    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Join or leave failure for a resource group.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GroupOperationError {
    #[error("Cannot {op} group {resource_id}: connection is not established")]
    NotConnected { op: GroupOp, resource_id: ResourceId },

    #[error("Failed to {op} group {resource_id}: {source}")]
    Transport {
        op: GroupOp,
        resource_id: ResourceId,
        #[source]
        source: TransportError,
    },
}

/// Failure reported by a REST collaborator.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request failed with status {status}: {}", body.as_deref().unwrap_or("<empty body>"))]
    Status { status: u16, body: Option<String> },

    #[error("Response body could not be decoded: {0}")]
    Decode(String),

    #[error(transparent)]
    Request(#[from] anyhow::Error),
}

/// Failure of a like/unlike toggle. The optimistic change has been rolled back.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("Liking requires an authenticated session")]
    NotAuthenticated,

    #[error("Resource {0} is not observed")]
    NotObserved(ResourceId),

    #[error("Resource {0} has no authoritative state yet")]
    NotSeeded(ResourceId),

    #[error("{kind} of {resource_id} was rejected: {source}")]
    Rejected {
        resource_id: ResourceId,
        kind: MutationKind,
        #[source]
        source: ApiError,
    },
}

/// Failure of the authoritative fetch for a resource.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Fetching engagement state of {resource_id} failed: {source}")]
    Fetch {
        resource_id: ResourceId,
        #[source]
        source: ApiError,
    },

    #[error("Resource {0} was released before its state arrived")]
    Abandoned(ResourceId),
}

/// Failure while loading the engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
