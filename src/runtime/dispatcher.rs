//! Dialogue dispatcher
//!
//! Single consumer of inbound messages and follow-up timers. Owns the
//! `SessionStore`; each item is transitioned, stored and fully executed
//! before the next one is taken.

use super::error::{DeliveryError, TransportError};
use super::lifecycle::Lease;
use super::traits::NotificationGateway;
use super::{notify_with_timeout, InboundMessage, INTAKE_TAG};
use crate::config::Timings;
use crate::state_machine::{
    replies, transition, ConvContext, ConvState, Effect, Event, IntakeRecord,
};
use crate::store::SessionStore;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const FOLLOW_UP_QUEUE: usize = 64;

/// Published after every processed item
#[derive(Debug, Clone)]
pub struct DialogueUpdate {
    pub correspondent: String,
    /// `None` when the correspondent has no entry
    pub state: Option<ConvState>,
}

struct PendingFollowUp {
    token: u64,
    task: JoinHandle<()>,
}

pub struct Dispatcher {
    inbound: mpsc::Receiver<InboundMessage>,
    lease: watch::Receiver<Option<Lease>>,
    gateway: Arc<dyn NotificationGateway>,
    timings: Timings,
    cancel: CancellationToken,
    updates: broadcast::Sender<DialogueUpdate>,
    store: SessionStore,
    follow_ups: HashMap<String, PendingFollowUp>,
    follow_up_tx: mpsc::Sender<(String, u64)>,
    follow_up_rx: mpsc::Receiver<(String, u64)>,
    next_token: u64,
}

impl Dispatcher {
    pub fn new(
        inbound: mpsc::Receiver<InboundMessage>,
        lease: watch::Receiver<Option<Lease>>,
        gateway: Arc<dyn NotificationGateway>,
        timings: Timings,
        cancel: CancellationToken,
        updates: broadcast::Sender<DialogueUpdate>,
    ) -> Self {
        let (follow_up_tx, follow_up_rx) = mpsc::channel(FOLLOW_UP_QUEUE);
        Self {
            inbound,
            lease,
            gateway,
            timings,
            cancel,
            updates,
            store: SessionStore::new(),
            follow_ups: HashMap::new(),
            follow_up_tx,
            follow_up_rx,
            next_token: 0,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Starting dispatcher");

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(message) = self.inbound.recv() => self.handle_inbound(message).await,
                Some((correspondent, token)) = self.follow_up_rx.recv() => {
                    self.follow_up_due(correspondent, token).await;
                }
                else => break,
            }
        }

        for (_, pending) in self.follow_ups.drain() {
            pending.task.abort();
        }
        tracing::info!(tracked = self.store.len(), "Dispatcher stopped");
    }

    async fn handle_inbound(&mut self, message: InboundMessage) {
        let InboundMessage {
            correspondent,
            body,
        } = message;
        // Whitespace-only bodies still count as an answer
        if body.is_empty() {
            tracing::debug!(correspondent = %correspondent, "Skipping empty message");
            return;
        }
        self.process(correspondent, Event::inbound(body)).await;
    }

    async fn follow_up_due(&mut self, correspondent: String, token: u64) {
        if self.follow_ups.get(&correspondent).map(|p| p.token) != Some(token) {
            tracing::debug!(correspondent = %correspondent, token, "Ignoring replaced follow-up");
            return;
        }
        self.follow_ups.remove(&correspondent);
        self.process(correspondent, Event::FollowUpDue).await;
    }

    async fn process(&mut self, correspondent: String, event: Event) {
        let context = ConvContext::new(correspondent.as_str(), self.timings.follow_up_delay);

        let result = match transition(self.store.lookup(&correspondent), &context, event) {
            Ok(result) => result,
            Err(e) => {
                // State stays as it was
                tracing::warn!(correspondent = %correspondent, error = %e, "Transition failed");
                self.deliver(&correspondent, replies::APOLOGY).await;
                let state = self.store.lookup(&correspondent).cloned();
                let _ = self.updates.send(DialogueUpdate {
                    correspondent,
                    state,
                });
                return;
            }
        };

        let was_tracked = self.store.has(&correspondent);
        let menu_reset = result
            .effects
            .iter()
            .any(|e| e.reply_text() == Some(replies::FULL_MENU));
        if result.new_state.is_none() || menu_reset {
            self.cancel_follow_up(&correspondent);
        }
        self.store.apply(&correspondent, result.new_state.clone());

        match (was_tracked, &result.new_state) {
            (false, Some(_)) => tracing::info!(correspondent = %correspondent, "Dialogue started"),
            (true, None) => tracing::info!(correspondent = %correspondent, "Dialogue ended"),
            _ => {}
        }

        tracing::debug!(
            correspondent = %correspondent,
            phase = ?result.new_state.as_ref().map(ConvState::phase),
            effects = result.effects.len(),
            tracked = self.store.len(),
            "Transition applied"
        );

        for effect in result.effects {
            self.execute_effect(&correspondent, effect).await;
        }

        let _ = self.updates.send(DialogueUpdate {
            correspondent,
            state: result.new_state,
        });
    }

    async fn execute_effect(&mut self, correspondent: &str, effect: Effect) {
        match effect {
            Effect::Reply { text } => self.deliver(correspondent, &text).await,
            Effect::ScheduleFollowUp { delay } => self.schedule_follow_up(correspondent, delay),
            Effect::NotifyIntake { record } => self.notify_intake(&record).await,
        }
    }

    /// Send on the leased handle; on failure, one attempt on the alternate path
    async fn deliver(&self, to: &str, text: &str) {
        let Some(lease) = self.lease.borrow().clone() else {
            tracing::warn!(correspondent = %to, "No ready session, reply dropped");
            return;
        };
        let limit = self.timings.send_timeout;

        let Err(e) = bounded_send(lease.transport.send(to, text), limit).await else {
            return;
        };
        tracing::warn!(
            correspondent = %to,
            generation = lease.generation,
            error = %e,
            "Reply failed, trying alternate path"
        );

        let current = self.lease.borrow().as_ref().map(|l| l.generation);
        if current != Some(lease.generation) {
            tracing::warn!(correspondent = %to, "Session replaced, alternate path skipped");
            return;
        }

        match bounded_send(lease.transport.send_direct(to, text), limit).await {
            Ok(()) => tracing::info!(correspondent = %to, "Reply delivered on alternate path"),
            Err(e) => tracing::error!(correspondent = %to, error = %e, "Reply lost"),
        }
    }

    async fn notify_intake(&self, record: &IntakeRecord) {
        let intake_id = Uuid::new_v4();
        let completed_at = chrono::Utc::now();

        match notify_with_timeout(
            self.gateway.as_ref(),
            INTAKE_TAG,
            &record.notification_body(),
            self.timings.notify_timeout,
        )
        .await
        {
            Ok(()) => tracing::info!(
                intake_id = %intake_id,
                correspondent = %record.correspondent,
                completed_at = %completed_at.to_rfc3339(),
                "Intake delivered"
            ),
            // The correspondent has already been thanked
            Err(e) => tracing::error!(
                intake_id = %intake_id,
                correspondent = %record.correspondent,
                completed_at = %completed_at.to_rfc3339(),
                error = %e,
                "Intake notification failed"
            ),
        }
    }

    fn schedule_follow_up(&mut self, correspondent: &str, delay: Duration) {
        self.next_token += 1;
        let token = self.next_token;
        let tx = self.follow_up_tx.clone();
        let key = correspondent.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send((key, token)).await;
        });

        if let Some(previous) = self
            .follow_ups
            .insert(correspondent.to_string(), PendingFollowUp { token, task })
        {
            previous.task.abort();
        }
    }

    fn cancel_follow_up(&mut self, correspondent: &str) {
        if let Some(pending) = self.follow_ups.remove(correspondent) {
            pending.task.abort();
        }
    }
}

async fn bounded_send(
    send: impl Future<Output = Result<(), TransportError>>,
    limit: Duration,
) -> Result<(), DeliveryError> {
    match tokio::time::timeout(limit, send).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DeliveryError::reply(e.to_string())),
        Err(_) => Err(DeliveryError::reply(format!("send timed out after {limit:?}"))),
    }
}
