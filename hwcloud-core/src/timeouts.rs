//! Per-operation timeouts
//!
//! Every wait is bounded by the timeout of the operation it belongs to.
//! Values are written as humantime strings ("10m", "1h 30m") in configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// CRUD operation a wait belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "humantime_serde")]
    pub create: Duration,
    #[serde(with = "humantime_serde")]
    pub read: Duration,
    #[serde(with = "humantime_serde")]
    pub update: Duration,
    #[serde(with = "humantime_serde")]
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(10 * 60),
            read: Duration::from_secs(5 * 60),
            update: Duration::from_secs(10 * 60),
            delete: Duration::from_secs(10 * 60),
        }
    }
}

impl Timeouts {
    /// Same timeout for create, update and delete
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            create: timeout,
            update: timeout,
            delete: timeout,
            ..Self::default()
        }
    }

    pub fn with_create(mut self, create: Duration) -> Self {
        self.create = create;
        self
    }

    pub fn with_delete(mut self, delete: Duration) -> Self {
        self.delete = delete;
        self
    }

    pub fn for_operation(&self, operation: Operation) -> Duration {
        match operation {
            Operation::Create => self.create,
            Operation::Read => self.read,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        }
    }
}
