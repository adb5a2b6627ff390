//! Runtime for the intake agent
//!
//! Two single-consumer loops:
//! - the session lifecycle loop owns the transport handle and its retry timer
//! - the dispatcher loop owns every correspondent's dialogue state
//!
//! Transport callbacks only push typed events into their channels.

mod dispatcher;
mod error;
mod lifecycle;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use dispatcher::{DialogueUpdate, Dispatcher};
pub use error::{DeliveryError, TransportError, TransportErrorKind};
pub use lifecycle::{Generation, LifecyclePhase, LifecycleSnapshot, SessionManager, TransportEvents};
pub use traits::*;

use crate::config::Timings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Recipient tag for completed intakes
pub const INTAKE_TAG: &str = "new-intake";
/// Recipient tag for session bootstrap codes
pub const BOOTSTRAP_TAG: &str = "bootstrap-code";
/// Second route for bootstrap codes when the first one fails
pub const BOOTSTRAP_BACKUP_TAG: &str = "bootstrap-code-backup";

/// Inbound messages waiting for the dispatcher
const INBOUND_QUEUE: usize = 256;

/// Identity of the one logical messaging session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub session_id: String,
    /// Where the transport keeps credentials for this session; never read here
    pub credentials_dir: PathBuf,
}

impl SessionSpec {
    pub fn new(session_id: &str, session_dir: &Path) -> Self {
        Self {
            session_id: session_id.to_string(),
            credentials_dir: session_dir.join(format!("session-{session_id}")),
        }
    }
}

/// A message from a correspondent on the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub correspondent: String,
    pub body: String,
}

/// Call the gateway under a time bound
pub(crate) async fn notify_with_timeout(
    gateway: &dyn NotificationGateway,
    recipient_tag: &str,
    body: &str,
    limit: Duration,
) -> Result<(), DeliveryError> {
    match tokio::time::timeout(limit, gateway.notify(recipient_tag, body)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::notification(format!(
            "gateway did not answer within {limit:?}"
        ))),
    }
}

/// The assembled agent: lifecycle loop plus dispatcher loop
pub struct IntakeService {
    sessions: SessionManager,
    updates: broadcast::Sender<DialogueUpdate>,
    dispatcher_cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IntakeService {
    pub fn spawn(
        spec: SessionSpec,
        connector: Arc<dyn TransportConnector>,
        gateway: Arc<dyn NotificationGateway>,
        timings: Timings,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (sessions, lifecycle_task) =
            SessionManager::spawn(spec, connector, gateway.clone(), inbound_tx, timings.clone());

        let (updates, _) = broadcast::channel(128);
        let dispatcher_cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            inbound_rx,
            sessions.lease(),
            gateway,
            timings,
            dispatcher_cancel.clone(),
            updates.clone(),
        );
        let dispatcher_task = tokio::spawn(dispatcher.run());

        Self {
            sessions,
            updates,
            dispatcher_cancel,
            tasks: Mutex::new(vec![lifecycle_task, dispatcher_task]),
        }
    }

    /// Bring the session up; retries are handled internally
    pub async fn start(&self) {
        self.sessions.start().await;
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Dialogue state after each processed message
    #[allow(dead_code)] // Observability hook; used by tests
    pub fn subscribe(&self) -> broadcast::Receiver<DialogueUpdate> {
        self.updates.subscribe()
    }

    /// Tear down the session, stop both loops and cancel every timer.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        self.dispatcher_cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Runtime task ended abnormally");
            }
        }
    }
}
