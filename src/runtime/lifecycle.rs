//! Session lifecycle manager
//!
//! A single actor loop owns the transport handle, the connect task and the
//! retry timer. Every handle is stamped with a generation; anything reported
//! by an older generation is dropped.

use super::error::LifecycleError;
use super::traits::{NotificationGateway, Transport, TransportConnector};
use super::{
    notify_with_timeout, InboundMessage, SessionSpec, BOOTSTRAP_BACKUP_TAG, BOOTSTRAP_TAG,
};
use crate::config::Timings;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Monotonic id of a transport handle
pub type Generation = u64;

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Uninitialized,
    Initializing,
    Ready,
    Disconnected,
    /// Terminal; only `shutdown()` gets here
    Stopped,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Stopped => "stopped",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    pub phase: LifecyclePhase,
    pub generation: Generation,
    pub retry_pending: bool,
}

/// A ready handle, lent to the dispatcher for sending replies.
/// Cleared as soon as the lifecycle loop gives the handle up.
#[derive(Clone)]
pub struct Lease {
    pub generation: Generation,
    pub transport: Arc<dyn Transport>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// What a transport handle can report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InboundMessage),
    Disconnected { reason: String },
    BootstrapCode { code: String },
    AuthFailure { message: String },
}

/// Event sink handed to a transport at creation, bound to its generation
#[derive(Clone)]
pub struct TransportEvents {
    generation: Generation,
    tx: mpsc::Sender<Command>,
}

impl TransportEvents {
    /// Sink bound to no lifecycle loop; every event is dropped
    #[cfg(test)]
    pub fn detached(generation: Generation) -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { generation, tx }
    }

    #[allow(dead_code)] // Used by mock transports
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub async fn emit(&self, event: TransportEvent) {
        let command = Command::Transport {
            generation: self.generation,
            event,
        };
        if self.tx.send(command).await.is_err() {
            tracing::debug!(generation = self.generation, "Lifecycle loop gone, event dropped");
        }
    }

    pub async fn message(&self, correspondent: impl Into<String>, body: impl Into<String>) {
        self.emit(TransportEvent::Message(InboundMessage {
            correspondent: correspondent.into(),
            body: body.into(),
        }))
        .await;
    }

    pub async fn disconnected(&self, reason: impl Into<String>) {
        self.emit(TransportEvent::Disconnected {
            reason: reason.into(),
        })
        .await;
    }

    pub async fn bootstrap_code(&self, code: impl Into<String>) {
        self.emit(TransportEvent::BootstrapCode { code: code.into() })
            .await;
    }

    pub async fn auth_failure(&self, message: impl Into<String>) {
        self.emit(TransportEvent::AuthFailure {
            message: message.into(),
        })
        .await;
    }
}

enum Command {
    Start,
    /// `generation: None` comes from the public API and is always honoured
    Disconnect {
        generation: Option<Generation>,
        reason: String,
    },
    Transport {
        generation: Generation,
        event: TransportEvent,
    },
    ConnectFinished {
        generation: Generation,
        result: Result<(), LifecycleError>,
    },
    RetryDue {
        timer: u64,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the lifecycle loop
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<LifecycleSnapshot>,
    lease: watch::Receiver<Option<Lease>>,
}

impl SessionManager {
    /// Spawn the lifecycle loop. Inbound messages from the current handle go to `inbound`.
    pub fn spawn(
        spec: SessionSpec,
        connector: Arc<dyn TransportConnector>,
        gateway: Arc<dyn NotificationGateway>,
        inbound: mpsc::Sender<InboundMessage>,
        timings: Timings,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (snapshot_tx, snapshot_rx) = watch::channel(LifecycleSnapshot {
            phase: LifecyclePhase::Uninitialized,
            generation: 0,
            retry_pending: false,
        });
        let (lease_tx, lease_rx) = watch::channel(None);

        let actor = Lifecycle {
            spec,
            connector,
            gateway,
            inbound,
            timings,
            commands_tx: commands_tx.clone(),
            commands_rx,
            snapshot_tx,
            lease_tx,
            phase: LifecyclePhase::Uninitialized,
            generation: 0,
            current: None,
            connect_task: None,
            retry: None,
            next_timer: 0,
        };
        let task = tokio::spawn(actor.run());

        (
            Self {
                commands: commands_tx,
                snapshot: snapshot_rx,
                lease: lease_rx,
            },
            task,
        )
    }

    /// Idempotent; a no-op while connecting, when ready, or after shutdown
    pub async fn start(&self) {
        self.send(Command::Start).await;
    }

    /// Discard the current handle and arm the reconnect backoff
    #[allow(dead_code)] // Transports report disconnection through `TransportEvents`
    pub async fn handle_disconnection(&self, reason: impl Into<String>) {
        self.send(Command::Disconnect {
            generation: None,
            reason: reason.into(),
        })
        .await;
    }

    /// Cancel timers, tear down the handle under its bound, stop the loop.
    /// Returns once the loop has finished; a second call returns immediately.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { done: done_tx })
            .await
            .is_err()
        {
            return;
        }
        // Sender dropped means the loop already exited
        let _ = done_rx.await;
    }

    pub fn status(&self) -> LifecycleSnapshot {
        self.snapshot.borrow().clone()
    }

    #[allow(dead_code)] // Observability hook; used by tests
    pub fn subscribe(&self) -> watch::Receiver<LifecycleSnapshot> {
        self.snapshot.clone()
    }

    pub fn lease(&self) -> watch::Receiver<Option<Lease>> {
        self.lease.clone()
    }

    async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            tracing::debug!("Lifecycle loop stopped, command ignored");
        }
    }
}

struct PendingRetry {
    timer: u64,
    task: JoinHandle<()>,
}

struct Lifecycle {
    spec: SessionSpec,
    connector: Arc<dyn TransportConnector>,
    gateway: Arc<dyn NotificationGateway>,
    inbound: mpsc::Sender<InboundMessage>,
    timings: Timings,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<LifecycleSnapshot>,
    lease_tx: watch::Sender<Option<Lease>>,
    phase: LifecyclePhase,
    generation: Generation,
    current: Option<Arc<dyn Transport>>,
    connect_task: Option<JoinHandle<()>>,
    retry: Option<PendingRetry>,
    next_timer: u64,
}

impl Lifecycle {
    async fn run(mut self) {
        tracing::info!(session_id = %self.spec.session_id, "Starting session lifecycle");

        while let Some(command) = self.commands_rx.recv().await {
            match command {
                Command::Start => self.start(),
                Command::Disconnect { generation, reason } => {
                    self.handle_disconnection(generation, &reason);
                }
                Command::Transport { generation, event } => {
                    self.handle_transport_event(generation, event).await;
                }
                Command::ConnectFinished { generation, result } => {
                    self.connect_finished(generation, result);
                }
                Command::RetryDue { timer } => self.retry_due(timer),
                Command::Shutdown { done } => {
                    self.shutdown().await;
                    let _ = done.send(());
                    break;
                }
            }
        }

        // Late shutdown callers find the channel closed and return at once
        self.commands_rx.close();
        tracing::info!(session_id = %self.spec.session_id, "Session lifecycle stopped");
    }

    fn start(&mut self) {
        match self.phase {
            LifecyclePhase::Initializing | LifecyclePhase::Ready => {
                tracing::debug!(phase = %self.phase, "Start ignored, session already up");
                return;
            }
            LifecyclePhase::Stopped => {
                tracing::debug!("Start ignored after shutdown");
                return;
            }
            LifecyclePhase::Uninitialized | LifecyclePhase::Disconnected => {}
        }

        self.cancel_retry();
        self.discard_current();
        self.generation += 1;
        let generation = self.generation;
        self.set_phase(LifecyclePhase::Initializing);

        let events = TransportEvents {
            generation,
            tx: self.commands_tx.clone(),
        };
        let transport = match self.connector.create(&self.spec, events) {
            Ok(transport) => transport,
            Err(e) => {
                self.connect_failed(generation, &LifecycleError::ConnectFailure(e));
                return;
            }
        };
        self.current = Some(transport.clone());

        tracing::info!(
            session_id = %self.spec.session_id,
            generation,
            "Connecting transport"
        );

        let limit = self.timings.connect_timeout;
        let tx = self.commands_tx.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, transport.connect()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(LifecycleError::ConnectFailure(e)),
                Err(_) => Err(LifecycleError::ConnectTimeout(limit)),
            };
            let _ = tx.send(Command::ConnectFinished { generation, result }).await;
        }));
    }

    fn connect_finished(&mut self, generation: Generation, result: Result<(), LifecycleError>) {
        if generation != self.generation || self.phase != LifecyclePhase::Initializing {
            tracing::debug!(
                generation,
                current = self.generation,
                "Ignoring connect result from stale handle"
            );
            return;
        }
        self.connect_task = None;

        match result {
            Ok(()) => {
                let Some(transport) = self.current.clone() else {
                    return;
                };
                self.lease_tx.send_replace(Some(Lease {
                    generation,
                    transport,
                }));
                self.set_phase(LifecyclePhase::Ready);
                tracing::info!(
                    session_id = %self.spec.session_id,
                    generation,
                    "Transport ready"
                );
            }
            Err(e) => self.connect_failed(generation, &e),
        }
    }

    fn connect_failed(&mut self, generation: Generation, error: &LifecycleError) {
        tracing::warn!(generation, error = %error, "Connect attempt failed");
        self.connect_task = None;
        self.discard_current();
        self.set_phase(LifecyclePhase::Uninitialized);
        self.arm_retry(self.timings.connect_retry_delay);
    }

    fn handle_disconnection(&mut self, generation: Option<Generation>, reason: &str) {
        if let Some(generation) = generation {
            if generation != self.generation {
                tracing::debug!(
                    generation,
                    current = self.generation,
                    "Ignoring disconnection from stale handle"
                );
                return;
            }
        }
        if self.phase == LifecyclePhase::Stopped {
            return;
        }

        tracing::warn!(generation = self.generation, reason = %reason, "Transport disconnected");
        self.set_phase(LifecyclePhase::Disconnected);

        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.discard_current();
        self.set_phase(LifecyclePhase::Uninitialized);
        self.arm_retry(self.timings.disconnect_retry_delay);
    }

    async fn handle_transport_event(&mut self, generation: Generation, event: TransportEvent) {
        // A discarded handle keeps its generation until the next start
        if generation != self.generation || self.current.is_none() {
            tracing::debug!(
                generation,
                current = self.generation,
                "Dropping event from stale handle"
            );
            return;
        }

        match event {
            TransportEvent::Disconnected { reason } => {
                self.handle_disconnection(Some(generation), &reason);
            }
            TransportEvent::Message(message) => {
                if self.inbound.send(message).await.is_err() {
                    tracing::warn!("Dispatcher gone, inbound message dropped");
                }
            }
            TransportEvent::BootstrapCode { code } => self.forward_bootstrap_code(code),
            TransportEvent::AuthFailure { message } => {
                tracing::warn!(generation, message = %message, "Transport authentication failed");
            }
        }
    }

    fn forward_bootstrap_code(&self, code: String) {
        let gateway = self.gateway.clone();
        let limit = self.timings.notify_timeout;
        tokio::spawn(async move {
            let Err(e) = notify_with_timeout(gateway.as_ref(), BOOTSTRAP_TAG, &code, limit).await
            else {
                tracing::info!("Bootstrap code forwarded");
                return;
            };
            tracing::warn!(error = %e, "Bootstrap code delivery failed, trying backup route");
            match notify_with_timeout(gateway.as_ref(), BOOTSTRAP_BACKUP_TAG, &code, limit).await {
                Ok(()) => tracing::info!("Bootstrap code forwarded on backup route"),
                Err(e) => tracing::error!(error = %e, "Bootstrap code could not be delivered"),
            }
        });
    }

    fn retry_due(&mut self, timer: u64) {
        if self.retry.as_ref().map(|p| p.timer) != Some(timer) {
            tracing::debug!(timer, "Ignoring cancelled retry timer");
            return;
        }
        self.retry = None;
        self.publish();
        tracing::info!(session_id = %self.spec.session_id, "Retrying session start");
        self.start();
    }

    fn arm_retry(&mut self, delay: Duration) {
        self.cancel_retry();
        self.next_timer += 1;
        let timer = self.next_timer;
        let tx = self.commands_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::RetryDue { timer }).await;
        });
        self.retry = Some(PendingRetry { timer, task });
        self.publish();
        tracing::info!(delay_secs = delay.as_secs(), "Session retry scheduled");
    }

    fn cancel_retry(&mut self) {
        if let Some(pending) = self.retry.take() {
            pending.task.abort();
            self.publish();
        }
    }

    /// Give up the current handle: clear the lease first, then tear down off-loop
    fn discard_current(&mut self) {
        self.lease_tx.send_replace(None);
        let Some(transport) = self.current.take() else {
            return;
        };
        let generation = self.generation;
        let limit = self.timings.teardown_timeout;
        tokio::spawn(async move {
            if let Err(e) = teardown(transport.as_ref(), limit).await {
                tracing::debug!(generation, error = %e, "Background teardown failed");
            }
        });
    }

    async fn shutdown(&mut self) {
        tracing::info!(session_id = %self.spec.session_id, "Shutting down session");
        self.cancel_retry();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.lease_tx.send_replace(None);

        if let Some(transport) = self.current.take() {
            match teardown(transport.as_ref(), self.timings.teardown_timeout).await {
                Ok(()) => tracing::info!("Transport torn down"),
                Err(e) => tracing::warn!(error = %e, "Teardown failed, handle abandoned"),
            }
        }
        self.set_phase(LifecyclePhase::Stopped);
    }

    fn set_phase(&mut self, phase: LifecyclePhase) {
        self.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(LifecycleSnapshot {
            phase: self.phase,
            generation: self.generation,
            retry_pending: self.retry.is_some(),
        });
    }
}

async fn teardown(transport: &dyn Transport, limit: Duration) -> Result<(), LifecycleError> {
    match tokio::time::timeout(limit, transport.destroy()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(LifecycleError::TeardownFailure(e)),
        Err(_) => Err(LifecycleError::TeardownTimeout(limit)),
    }
}
