//! Collector adapter boundary.
//!
//! Engine-specific counter extraction lives behind [`CollectorAdapter`]; the
//! scheduler only sees raw samples or a classified error.

mod http;

pub use http::*;

use crate::db::{RawSample, ServerTarget};

use async_trait::async_trait;
use thiserror::Error;

/// Failures a collector adapter may report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectorError {
    #[error("connectivity error: {0}")]
    Connectivity(String),
    #[error("permission error: {0}")]
    Permission(String),
    #[error("query timed out: {0}")]
    QueryTimeout(String),
    #[error("unsupported on this server version: {0}")]
    Unsupported(String),
}

/// How the scheduler should react to a collector failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried at the normal cadence.
    Transient,
    /// Needs operator action; the collector is suspended for that server.
    Configuration,
}

impl CollectorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CollectorError::Connectivity(_) | CollectorError::QueryTimeout(_) => ErrorClass::Transient,
            CollectorError::Permission(_) | CollectorError::Unsupported(_) => ErrorClass::Configuration,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, CollectorError::Connectivity(_))
    }
}

/// Produces a snapshot of raw counter values for one server and category.
#[async_trait]
pub trait CollectorAdapter: Send + Sync {
    async fn collect(&self, server: &ServerTarget, category: &str) -> Result<RawSample, CollectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(CollectorError::Connectivity("refused".into()).class(), ErrorClass::Transient);
        assert_eq!(CollectorError::QueryTimeout("30s".into()).class(), ErrorClass::Transient);
        assert_eq!(CollectorError::Permission("VIEW SERVER STATE".into()).class(), ErrorClass::Configuration);
        assert_eq!(CollectorError::Unsupported("2012".into()).class(), ErrorClass::Configuration);
        assert!(CollectorError::Connectivity("x".into()).is_connectivity());
    }
}
