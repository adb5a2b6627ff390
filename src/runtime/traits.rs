//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the lifecycle and dispatcher loops with mock
//! implementations.

use super::error::{DeliveryError, TransportError};
use super::lifecycle::TransportEvents;
use super::SessionSpec;
use async_trait::async_trait;
use std::sync::Arc;

/// One live messaging session.
///
/// The handle pushes what it receives into the `TransportEvents` it was created with.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the session. Resolves once it is ready for traffic.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear the session down and release its resources
    async fn destroy(&self) -> Result<(), TransportError>;

    /// Reply to a correspondent
    async fn send(&self, to: &str, text: &str) -> Result<(), TransportError>;

    /// Alternate delivery path, used once when `send` fails
    async fn send_direct(&self, to: &str, text: &str) -> Result<(), TransportError>;
}

/// Builds transport handles. Called once per (re)connect with the same session spec.
pub trait TransportConnector: Send + Sync {
    fn create(
        &self,
        spec: &SessionSpec,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Out-of-band notifications (intake records, bootstrap codes)
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// `recipient_tag` is a routing label, not necessarily an address
    async fn notify(&self, recipient_tag: &str, body: &str) -> Result<(), DeliveryError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn connect(&self) -> Result<(), TransportError> {
        (**self).connect().await
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        (**self).destroy().await
    }

    async fn send(&self, to: &str, text: &str) -> Result<(), TransportError> {
        (**self).send(to, text).await
    }

    async fn send_direct(&self, to: &str, text: &str) -> Result<(), TransportError> {
        (**self).send_direct(to, text).await
    }
}

#[async_trait]
impl<T: NotificationGateway + ?Sized> NotificationGateway for Arc<T> {
    async fn notify(&self, recipient_tag: &str, body: &str) -> Result<(), DeliveryError> {
        (**self).notify(recipient_tag, body).await
    }
}
