//! Refresh - One-shot probes of remote state
//!
//! A refresh function performs exactly one idempotent read of a remote
//! resource and classifies it into a typed status. Retrying and sleeping are
//! the watcher's job, never the refresh function's.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;

/// Status vocabulary of a resource family
///
/// Implemented by small closed enums (one per resource family) that are
/// translated from raw API strings at the refresh boundary. The watcher only
/// compares statuses for equality, so no normalization happens past that
/// boundary.
pub trait Status: Clone + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> Status for T where T: Clone + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static {}

/// What a single refresh observed
#[derive(Debug, Clone, PartialEq)]
pub enum Observation<T, S> {
    /// The resource (or job) exists and reports a status
    Found { snapshot: T, status: S },
    /// The remote side reported the object as absent
    NotFound,
}

impl<T, S> Observation<T, S> {
    pub fn found(snapshot: T, status: S) -> Self {
        Self::Found { snapshot, status }
    }

    pub fn status(&self) -> Option<&S> {
        match self {
            Self::Found { status, .. } => Some(status),
            Self::NotFound => None,
        }
    }
}

/// Fatal failure reported by a refresh function
///
/// Returning this aborts the wait immediately. It is distinct from "not yet
/// converged", which is expressed by returning a pending status.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RefreshError {
    /// Status label observed alongside the failure (e.g. "ERROR")
    pub status: Option<String>,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl RefreshError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// Failure paired with the remote status that caused it
    pub fn with_status(mut self, status: impl fmt::Display) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

pub type RefreshResult<T, S> = Result<Observation<T, S>, RefreshError>;

/// A read-only probe of current remote state
#[async_trait]
pub trait Refresh<T, S>: Send + Sync {
    async fn refresh(&self) -> RefreshResult<T, S>;
}

#[async_trait]
impl<T, S, F, Fut> Refresh<T, S> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = RefreshResult<T, S>> + Send,
    T: Send + 'static,
    S: Status,
{
    async fn refresh(&self) -> RefreshResult<T, S> {
        (self)().await
    }
}
