// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for checkout operations.

use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error from a checkout operation.
///
/// Errors are cheap to clone: a single factory failure is delivered to every caller that was
/// waiting on the same element.
///
/// # Example
///
/// ```
/// use leasecache::Error;
///
/// let error = Error::factory("connection refused");
/// assert!(error.is_factory());
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The element factory returned an error.
    ///
    /// The entry is discarded before this error is observed, so the next checkout of the same key
    /// runs the factory again.
    #[error("element factory failed: {0}")]
    Factory(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The element factory panicked.
    #[error("element factory panicked")]
    FactoryPanicked,

    /// The scope owning the cache has been cancelled.
    #[error("cache is closed")]
    Closed,
}

impl Error {
    /// Creates a factory error from any type that can be converted to an error.
    pub fn factory(cause: impl Into<BoxError>) -> Self {
        Self::Factory(Arc::from(cause.into()))
    }

    /// Returns `true` if the element factory failed or panicked.
    #[must_use]
    pub fn is_factory(&self) -> bool {
        matches!(self, Self::Factory(_) | Self::FactoryPanicked)
    }

    /// Returns `true` if the cache was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Attempts to downcast the factory cause to a concrete error type.
    #[must_use]
    pub fn source_as<T: std::error::Error + 'static>(&self) -> Option<&T> {
        match self {
            Self::Factory(cause) => cause.downcast_ref::<T>(),
            _ => None,
        }
    }
}

/// A specialized [`Result`] type for checkout operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
