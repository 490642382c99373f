//! Provider - Trait abstracting resource operations
//!
//! A Provider maps resource CRUD onto a cloud's APIs. Each mutating
//! operation is expected to return only after the remote side converged,
//! using the waiters in [`crate::wait`] and [`crate::job`].

use std::future::Future;
use std::pin::Pin;

use crate::job::JobError;
use crate::resource::{Resource, ResourceId, State};
use crate::retry::RetryError;
use crate::timeouts::Timeouts;
use crate::wait::WaitError;

/// Error type for Provider operations
#[derive(Debug)]
pub struct ProviderError {
    pub message: String,
    pub resource_id: Option<ResourceId>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}.{}] {}", id.resource_type, id.name, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resource_id: None,
            cause: None,
        }
    }

    pub fn for_resource(mut self, id: ResourceId) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Wrap a wait failure with context about what was being waited for
    pub fn waiting(context: impl std::fmt::Display, err: WaitError) -> Self {
        Self::new(format!("Error waiting for {}: {}", context, err)).with_cause(err)
    }

    /// Wrap a job failure with context about the operation that started it
    pub fn job(context: impl std::fmt::Display, err: JobError) -> Self {
        Self::new(format!("{}: {}", context, err)).with_cause(err)
    }

    fn wait_error(&self) -> Option<&WaitError> {
        let cause = self.cause.as_deref()?;
        if let Some(wait) = cause.downcast_ref::<WaitError>() {
            return Some(wait);
        }
        match cause.downcast_ref::<JobError>() {
            Some(JobError::Wait { source, .. }) => Some(source),
            _ => None,
        }
    }

    /// The operation gave up waiting; the remote side may still be working
    pub fn is_timeout(&self) -> bool {
        self.wait_error().is_some_and(WaitError::is_timeout)
    }

    /// The remote job reported failure
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self.cause.as_deref().and_then(|c| c.downcast_ref::<JobError>()),
            Some(JobError::Failed { .. })
        )
    }
}

impl From<WaitError> for ProviderError {
    fn from(err: WaitError) -> Self {
        Self::new(err.to_string()).with_cause(err)
    }
}

impl From<JobError> for ProviderError {
    fn from(err: JobError) -> Self {
        Self::new(err.to_string()).with_cause(err)
    }
}

impl From<RetryError<ProviderError>> for ProviderError {
    fn from(err: RetryError<ProviderError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => {
                let message = format!("Retries exhausted after {} attempts: {}", attempts, last);
                let resource_id = last.resource_id.clone();
                Self {
                    message,
                    resource_id,
                    cause: Some(Box::new(last)),
                }
            }
            RetryError::Permanent(e) | RetryError::Recovery(e) => e,
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Definition of resource types that a Provider can handle
pub trait ResourceType: Send + Sync {
    /// Resource type name (e.g., "evs_volume")
    fn name(&self) -> &'static str;

    /// Timeouts used when the resource does not override them
    fn default_timeouts(&self) -> Timeouts {
        Timeouts::default()
    }
}

/// Main Provider trait
///
/// Each cloud provider implements this trait. All operations are async and
/// involve side effects; mutating operations return once the remote state
/// converged or the operation's timeout elapsed.
pub trait Provider: Send + Sync {
    /// Name of this Provider (e.g., "huaweicloud")
    fn name(&self) -> &'static str;

    /// List of resource types this Provider can handle
    fn resource_types(&self) -> Vec<Box<dyn ResourceType>>;

    /// Get the current state of a resource
    ///
    /// Returns `State::not_found()` if the resource does not exist.
    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>>;

    /// Create a resource
    ///
    /// Returns State with identifier set to the cloud-side ID
    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>>;

    /// Update a resource
    fn update(
        &self,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>>;

    /// Delete a resource and wait until it is gone
    fn delete(&self, resource: &Resource, identifier: &str) -> BoxFuture<'_, ProviderResult<()>>;
}

/// Provider implementation for Box<dyn Provider>
/// This enables dynamic dispatch for Providers
impl Provider for Box<dyn Provider> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        (**self).resource_types()
    }

    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>> {
        (**self).read(id, identifier)
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        (**self).create(resource)
    }

    fn update(
        &self,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        (**self).update(identifier, from, to)
    }

    fn delete(&self, resource: &Resource, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        (**self).delete(resource, identifier)
    }
}
