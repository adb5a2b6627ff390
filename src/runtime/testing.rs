//! Mock implementations for testing
//!
//! These mocks drive the lifecycle and dispatcher loops without a relay or a
//! webhook. Runtime tests run with paused time, so retry and follow-up delays
//! elapse instantly once every task is idle.

use super::traits::*;
use super::{
    DeliveryError, DialogueUpdate, Generation, IntakeService, LifecyclePhase, LifecycleSnapshot,
    SessionSpec, TransportError, TransportEvents,
};
use crate::config::Timings;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// Mock Transport
// ============================================================================

/// How a mocked connect or destroy call resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail,
    /// Never resolves; only a timeout or abort ends it
    Hang,
}

impl Behavior {
    async fn run(self, what: &str) -> Result<(), TransportError> {
        match self {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(TransportError::rejected(format!("mock {what} failure"))),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// Transport handle that records what it is asked to send
#[allow(dead_code)]
pub struct MockTransport {
    pub spec: SessionSpec,
    events: TransportEvents,
    connect: Behavior,
    destroy: Behavior,
    failing_sends: AtomicUsize,
    failing_direct_sends: AtomicUsize,
    destroyed: AtomicBool,
    /// Every `send` call, successful or not
    pub send_attempts: Mutex<Vec<(String, String)>>,
    /// Every `send_direct` call, successful or not
    pub direct_attempts: Mutex<Vec<(String, String)>>,
    /// Messages that actually went out, on either path
    pub delivered: Mutex<Vec<(String, String)>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn events(&self) -> &TransportEvents {
        &self.events
    }

    pub fn generation(&self) -> Generation {
        self.events.generation()
    }

    /// Make the next `n` primary sends fail
    pub fn fail_sends(&self, n: usize) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` alternate-path sends fail
    pub fn fail_direct_sends(&self, n: usize) {
        self.failing_direct_sends.store(n, Ordering::SeqCst);
    }

    pub fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Texts delivered to one correspondent, in order
    pub fn delivered_to(&self, correspondent: &str) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == correspondent)
            .map(|(_, text)| text.clone())
            .collect()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect.run("connect").await
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        self.destroy.run("destroy").await?;
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, to: &str, text: &str) -> Result<(), TransportError> {
        self.send_attempts
            .lock()
            .unwrap()
            .push((to.to_string(), text.to_string()));
        if Self::take_failure(&self.failing_sends) {
            return Err(TransportError::closed("mock send failure"));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((to.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_direct(&self, to: &str, text: &str) -> Result<(), TransportError> {
        self.direct_attempts
            .lock()
            .unwrap()
            .push((to.to_string(), text.to_string()));
        if Self::take_failure(&self.failing_direct_sends) {
            return Err(TransportError::closed("mock direct send failure"));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((to.to_string(), text.to_string()));
        Ok(())
    }
}

// ============================================================================
// Mock Connector
// ============================================================================

/// Hands out `MockTransport`s following a queue of connect behaviors.
/// Once the queue is empty every connect succeeds.
pub struct MockConnector {
    connects: Mutex<VecDeque<Behavior>>,
    destroy: Behavior,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

#[allow(dead_code)]
impl MockConnector {
    pub fn new(connects: impl IntoIterator<Item = Behavior>, destroy: Behavior) -> Self {
        Self {
            connects: Mutex::new(connects.into_iter().collect()),
            destroy,
            transports: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.transports.lock().unwrap()[index].clone()
    }

    pub fn latest(&self) -> Arc<MockTransport> {
        self.transports
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport created yet")
    }

    pub fn specs(&self) -> Vec<SessionSpec> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.spec.clone())
            .collect()
    }
}

impl TransportConnector for MockConnector {
    fn create(
        &self,
        spec: &SessionSpec,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let connect = self
            .connects
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::Succeed);
        let transport = Arc::new(MockTransport {
            spec: spec.clone(),
            events,
            connect,
            destroy: self.destroy,
            failing_sends: AtomicUsize::new(0),
            failing_direct_sends: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            send_attempts: Mutex::new(Vec::new()),
            direct_attempts: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

// ============================================================================
// Mock Notification Gateway
// ============================================================================

/// Records every notify call; tags in `failing_tags` return an error
#[derive(Default)]
pub struct MockNotifier {
    pub calls: Mutex<Vec<(String, String)>>,
    failing_tags: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_tag(&self, tag: &str) {
        self.failing_tags.lock().unwrap().insert(tag.to_string());
    }

    pub fn recorded_calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationGateway for MockNotifier {
    async fn notify(&self, recipient_tag: &str, body: &str) -> Result<(), DeliveryError> {
        self.calls
            .lock()
            .unwrap()
            .push((recipient_tag.to_string(), body.to_string()));
        if self.failing_tags.lock().unwrap().contains(recipient_tag) {
            return Err(DeliveryError::notification(format!(
                "mock gateway refuses {recipient_tag}"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Test Service Builder
// ============================================================================

pub const TEST_SESSION_ID: &str = "intake-test";

/// Builder for an `IntakeService` wired to mocks
pub struct TestServiceBuilder {
    connects: Vec<Behavior>,
    destroy: Behavior,
    notifier: MockNotifier,
    timings: Timings,
}

#[allow(dead_code)]
impl TestServiceBuilder {
    pub fn new() -> Self {
        Self {
            connects: Vec::new(),
            destroy: Behavior::Succeed,
            notifier: MockNotifier::new(),
            timings: Timings::default(),
        }
    }

    /// Behaviors of successive connect attempts
    pub fn connects(mut self, connects: impl IntoIterator<Item = Behavior>) -> Self {
        self.connects = connects.into_iter().collect();
        self
    }

    pub fn destroy(mut self, destroy: Behavior) -> Self {
        self.destroy = destroy;
        self
    }

    pub fn failing_tag(self, tag: &str) -> Self {
        self.notifier.fail_tag(tag);
        self
    }

    pub fn build(self) -> TestService {
        let connector = Arc::new(MockConnector::new(self.connects, self.destroy));
        let notifier = Arc::new(self.notifier);
        let spec = SessionSpec::new(TEST_SESSION_ID, Path::new("/tmp/intake-test"));
        let service = IntakeService::spawn(spec, connector.clone(), notifier.clone(), self.timings);
        let updates = service.subscribe();
        TestService {
            service,
            connector,
            notifier,
            updates,
        }
    }
}

impl Default for TestServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Service under test plus handles to its mocks
pub struct TestService {
    pub service: IntakeService,
    pub connector: Arc<MockConnector>,
    pub notifier: Arc<MockNotifier>,
    updates: broadcast::Receiver<DialogueUpdate>,
}

#[allow(dead_code)]
impl TestService {
    pub fn builder() -> TestServiceBuilder {
        TestServiceBuilder::new()
    }

    pub fn status(&self) -> LifecycleSnapshot {
        self.service.sessions().status()
    }

    /// Wait until the lifecycle snapshot satisfies `predicate`
    pub async fn wait_for_status(
        &self,
        predicate: impl FnMut(&LifecycleSnapshot) -> bool,
        within: Duration,
    ) -> bool {
        let mut rx = self.service.sessions().subscribe();
        let reached = matches!(
            tokio::time::timeout(within, rx.wait_for(predicate)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub async fn wait_for_phase(&self, phase: LifecyclePhase, within: Duration) -> bool {
        self.wait_for_status(|s| s.phase == phase, within).await
    }

    /// Start and wait until the session is ready; returns its transport
    pub async fn ready(&self) -> Arc<MockTransport> {
        self.service.start().await;
        assert!(
            self.wait_for_phase(LifecyclePhase::Ready, Duration::from_secs(300))
                .await,
            "session never became ready"
        );
        self.connector.latest()
    }

    /// Deliver a message through the current transport and wait for the dispatcher
    pub async fn say(&mut self, from: &str, body: &str) -> DialogueUpdate {
        self.connector.latest().events().message(from, body).await;
        self.next_update().await
    }

    pub async fn next_update(&mut self) -> DialogueUpdate {
        tokio::time::timeout(Duration::from_secs(120), self.updates.recv())
            .await
            .expect("timed out waiting for dispatcher")
            .expect("update channel closed")
    }

    /// Poll until the notifier has seen `n` calls
    pub async fn wait_for_notifications(&self, n: usize) -> Vec<(String, String)> {
        for _ in 0..100 {
            let calls = self.notifier.recorded_calls();
            if calls.len() >= n {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.notifier.recorded_calls()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{BOOTSTRAP_BACKUP_TAG, BOOTSTRAP_TAG, INTAKE_TAG};
    use crate::state_machine::{replies, ConvState, Phase};
    use tokio::time::Instant;

    const PATIENT: &str = "573001234567@c.us";

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn phase(update: &DialogueUpdate) -> Option<Phase> {
        update.state.as_ref().map(ConvState::phase)
    }

    #[tokio::test]
    async fn test_mock_transport_failure_budget() {
        let svc = TestService::builder().build();
        let transport = svc.ready().await;

        transport.fail_sends(1);
        assert!(transport.send(PATIENT, "a").await.is_err());
        assert!(transport.send(PATIENT, "b").await.is_ok());
        assert_eq!(transport.send_attempts.lock().unwrap().len(), 2);
        assert_eq!(transport.delivered_to(PATIENT), vec!["b".to_string()]);
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_start_reaches_ready_and_is_idempotent() {
        let svc = TestService::builder().build();
        svc.ready().await;

        svc.service.start().await;
        svc.service.start().await;
        tokio::time::sleep(secs(1)).await;

        assert_eq!(svc.connector.created(), 1);
        let status = svc.status();
        assert_eq!(status.phase, LifecyclePhase::Ready);
        assert_eq!(status.generation, 1);
        assert!(!status.retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_schedules_retry() {
        let svc = TestService::builder()
            .connects([Behavior::Hang, Behavior::Succeed])
            .build();
        let started = Instant::now();
        svc.service.start().await;

        assert!(
            svc.wait_for_status(
                |s| s.phase == LifecyclePhase::Uninitialized && s.retry_pending,
                secs(120)
            )
            .await
        );
        assert!(started.elapsed() >= secs(60));

        assert!(svc.wait_for_phase(LifecyclePhase::Ready, secs(120)).await);
        assert!(started.elapsed() >= secs(90));
        assert_eq!(svc.connector.created(), 2);
        assert_eq!(svc.status().generation, 2);
        // The timed-out handle got a background teardown
        assert!(svc.connector.transport(0).was_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_schedules_retry() {
        let svc = TestService::builder()
            .connects([Behavior::Fail, Behavior::Succeed])
            .build();
        let started = Instant::now();
        svc.service.start().await;

        assert!(svc.wait_for_phase(LifecyclePhase::Ready, secs(120)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= secs(30) && elapsed < secs(60), "{elapsed:?}");
        assert_eq!(svc.connector.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_disconnection_arms_single_retry() {
        let svc = TestService::builder().build();
        svc.ready().await;

        svc.service.sessions().handle_disconnection("first").await;
        tokio::time::sleep(secs(10)).await;
        assert!(svc.status().retry_pending);

        let second = Instant::now();
        svc.service.sessions().handle_disconnection("second").await;
        tokio::time::sleep(secs(15)).await;

        // The first timer (due at 20 s) was cancelled
        assert_eq!(svc.connector.created(), 1);
        let status = svc.status();
        assert_eq!(status.phase, LifecyclePhase::Uninitialized);
        assert!(status.retry_pending);

        assert!(svc.wait_for_phase(LifecyclePhase::Ready, secs(60)).await);
        assert!(second.elapsed() >= secs(20));
        assert_eq!(svc.connector.created(), 2);

        tokio::time::sleep(secs(120)).await;
        assert_eq!(svc.connector.created(), 2);
        assert!(!svc.status().retry_pending);

        // Recreation reuses the stable session id
        let specs = svc.connector.specs();
        assert!(specs.iter().all(|s| s.session_id == TEST_SESSION_ID));
        assert_eq!(specs[0], specs[1]);
        assert!(svc.connector.transport(0).was_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_disconnect_event_triggers_reconnect() {
        let svc = TestService::builder().build();
        let transport = svc.ready().await;

        transport.events().disconnected("relay closed").await;
        assert!(
            svc.wait_for_status(|s| s.retry_pending, secs(1)).await,
            "no retry armed"
        );
        assert!(svc.service.sessions().lease().borrow().is_none());

        assert!(svc.wait_for_phase(LifecyclePhase::Ready, secs(60)).await);
        assert_eq!(svc.status().generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handle_disconnect_keeps_connect_backoff() {
        let svc = TestService::builder()
            .connects([Behavior::Fail, Behavior::Succeed])
            .build();
        let started = Instant::now();
        svc.service.start().await;
        assert!(svc.wait_for_status(|s| s.retry_pending, secs(1)).await);

        tokio::time::sleep(secs(25)).await;
        svc.connector.transport(0).events().disconnected("late").await;

        assert!(svc.wait_for_phase(LifecyclePhase::Ready, secs(120)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= secs(30) && elapsed < secs(40), "{elapsed:?}");
        assert_eq!(svc.connector.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_disconnects_from_dropped_handle_are_ignored() {
        let svc = TestService::builder().build();
        let old = svc.ready().await;

        let dropped = Instant::now();
        old.events().disconnected("relay closed").await;
        assert!(svc.wait_for_status(|s| s.retry_pending, secs(1)).await);

        tokio::time::sleep(secs(15)).await;
        old.events().disconnected("again").await;

        assert!(svc.wait_for_phase(LifecyclePhase::Ready, secs(120)).await);
        let elapsed = dropped.elapsed();
        assert!(elapsed >= secs(20) && elapsed < secs(30), "{elapsed:?}");

        for _ in 0..3 {
            tokio::time::sleep(secs(15)).await;
            old.events().disconnected("again").await;
        }
        tokio::time::sleep(secs(1)).await;
        let status = svc.status();
        assert_eq!(status.phase, LifecyclePhase::Ready);
        assert_eq!(status.generation, 2);
        assert!(!status.retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_events_are_dropped() {
        let mut svc = TestService::builder().build();
        let old = svc.ready().await;

        svc.service.sessions().handle_disconnection("test").await;
        assert!(
            svc.wait_for_status(
                |s| s.phase == LifecyclePhase::Ready && s.generation == 2,
                secs(60)
            )
            .await
        );

        old.events().message(PATIENT, "info").await;
        old.events().disconnected("late").await;

        // Processed in order after the stale events; the first update must be this one
        let update = svc.say("573009999999@c.us", "info").await;
        assert_eq!(update.correspondent, "573009999999@c.us");

        let status = svc.status();
        assert_eq!(status.phase, LifecyclePhase::Ready);
        assert_eq!(status.generation, 2);
        assert!(!status.retry_pending);
        assert!(old.send_attempts.lock().unwrap().is_empty());
        assert!(svc.connector.latest().delivered_to(PATIENT).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_does_not_change_phase() {
        let svc = TestService::builder().build();
        let transport = svc.ready().await;

        transport.events().auth_failure("credentials expired").await;
        tokio::time::sleep(secs(1)).await;

        let status = svc.status();
        assert_eq!(status.phase, LifecyclePhase::Ready);
        assert!(!status.retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_initializing_is_bounded() {
        let svc = TestService::builder()
            .connects([Behavior::Hang])
            .destroy(Behavior::Hang)
            .build();
        svc.service.start().await;
        assert!(svc.wait_for_phase(LifecyclePhase::Initializing, secs(1)).await);

        let began = Instant::now();
        svc.service.shutdown().await;
        let elapsed = began.elapsed();
        assert!(elapsed <= secs(6), "shutdown took {elapsed:?}");

        let status = svc.status();
        assert_eq!(status.phase, LifecyclePhase::Stopped);
        assert!(!status.retry_pending);

        tokio::time::sleep(secs(300)).await;
        assert_eq!(svc.connector.created(), 1);

        // Second call is a no-op
        let began = Instant::now();
        svc.service.shutdown().await;
        assert_eq!(began.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_retry() {
        let svc = TestService::builder().connects([Behavior::Fail]).build();
        svc.service.start().await;
        assert!(svc.wait_for_status(|s| s.retry_pending, secs(1)).await);

        svc.service.shutdown().await;
        let status = svc.status();
        assert_eq!(status.phase, LifecyclePhase::Stopped);
        assert!(!status.retry_pending);

        tokio::time::sleep(secs(120)).await;
        assert_eq!(svc.connector.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_shutdown_is_ignored() {
        let svc = TestService::builder().build();
        svc.ready().await;
        svc.service.shutdown().await;

        svc.service.start().await;
        tokio::time::sleep(secs(1)).await;
        assert_eq!(svc.connector.created(), 1);
        assert_eq!(svc.status().phase, LifecyclePhase::Stopped);
        assert!(svc.connector.transport(0).was_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_code_falls_back_to_backup_tag() {
        let svc = TestService::builder()
            .connects([Behavior::Hang])
            .failing_tag(BOOTSTRAP_TAG)
            .build();
        svc.service.start().await;
        assert!(svc.wait_for_phase(LifecyclePhase::Initializing, secs(1)).await);

        svc.connector.latest().events().bootstrap_code("2@AbCdEf").await;
        let calls = svc.wait_for_notifications(2).await;
        assert_eq!(
            calls,
            vec![
                (BOOTSTRAP_TAG.to_string(), "2@AbCdEf".to_string()),
                (BOOTSTRAP_BACKUP_TAG.to_string(), "2@AbCdEf".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_code_primary_route() {
        let svc = TestService::builder().connects([Behavior::Hang]).build();
        svc.service.start().await;
        assert!(svc.wait_for_phase(LifecyclePhase::Initializing, secs(1)).await);

        svc.connector.latest().events().bootstrap_code("2@XyZ").await;
        svc.wait_for_notifications(1).await;
        tokio::time::sleep(secs(1)).await;
        assert_eq!(
            svc.notifier.recorded_calls(),
            vec![(BOOTSTRAP_TAG.to_string(), "2@XyZ".to_string())]
        );
    }

    // ------------------------------------------------------------------------
    // Dialogue dispatch
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_intake() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        let update = svc.say(PATIENT, "info").await;
        assert_eq!(phase(&update), Some(Phase::MainMenu));

        let update = svc.say(PATIENT, "2").await;
        assert_eq!(phase(&update), Some(Phase::CollectingName));

        let update = svc.say(PATIENT, "Ana Gómez").await;
        assert_eq!(
            update.state,
            Some(ConvState::AwaitingEmail {
                name: "Ana Gómez".to_string(),
                phone: "573001234567".to_string(),
            })
        );

        let update = svc.say(PATIENT, "no").await;
        assert!(update.state.is_none());

        assert_eq!(
            transport.delivered_to(PATIENT),
            vec![
                replies::FULL_MENU.to_string(),
                replies::ASK_NAME.to_string(),
                replies::ASK_EMAIL.to_string(),
                replies::thank_you("Ana Gómez"),
            ]
        );

        let calls = svc.notifier.recorded_calls();
        assert_eq!(calls.len(), 1);
        let (tag, body) = &calls[0];
        assert_eq!(tag, INTAKE_TAG);
        assert!(body.contains("Ana Gómez"));
        assert!(body.contains("No proporcionado"));
        assert!(body.contains("573001234567"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_correspondent_is_ignored() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        let update = svc.say(PATIENT, "hola").await;
        assert!(update.state.is_none());
        assert!(transport.send_attempts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_is_skipped() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        transport.events().message(PATIENT, "").await;
        let update = svc.say(PATIENT, "info").await;
        assert!(update.state.is_some());
        assert_eq!(transport.send_attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whitespace_body_counts_as_invalid_answer() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        svc.say(PATIENT, "info").await;
        let update = svc.say(PATIENT, "   ").await;
        assert_eq!(
            update.state,
            Some(ConvState::MainMenu {
                menu_shown: true,
                invalid_attempts: 1
            })
        );
        assert_eq!(
            transport.delivered_to(PATIENT).last().map(String::as_str),
            Some(replies::MENU_REPROMPT)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_menu_exhaustion_deletes_state() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        svc.say(PATIENT, "info").await;
        assert!(svc.say(PATIENT, "x").await.state.is_some());
        assert!(svc.say(PATIENT, "y").await.state.is_some());
        assert!(svc.say(PATIENT, "z").await.state.is_none());

        let sent = transport.delivered_to(PATIENT);
        assert_eq!(sent[1], replies::MENU_REPROMPT);
        assert_eq!(sent[2], replies::MENU_REPROMPT);
        assert_eq!(sent[3], replies::MENU_EXHAUSTED);

        // Back to untracked
        assert!(svc.say(PATIENT, "1").await.state.is_none());
        assert_eq!(transport.delivered_to(PATIENT).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_failure_uses_alternate_path_once() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        transport.fail_sends(1);
        svc.say(PATIENT, "info").await;
        assert_eq!(transport.send_attempts.lock().unwrap().len(), 1);
        assert_eq!(transport.direct_attempts.lock().unwrap().len(), 1);
        assert_eq!(transport.delivered_to(PATIENT), vec![replies::FULL_MENU]);

        // Both paths fail: one alternate attempt, then the reply is lost
        transport.fail_sends(1);
        transport.fail_direct_sends(1);
        let update = svc.say(PATIENT, "2").await;
        assert_eq!(phase(&update), Some(Phase::CollectingName));
        assert_eq!(transport.send_attempts.lock().unwrap().len(), 2);
        assert_eq!(transport.direct_attempts.lock().unwrap().len(), 2);
        assert_eq!(transport.delivered_to(PATIENT).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_failure_still_acknowledged() {
        let mut svc = TestService::builder().failing_tag(INTAKE_TAG).build();
        let transport = svc.ready().await;

        for body in ["info", "2", "José Pérez-López"] {
            svc.say(PATIENT, body).await;
        }
        let update = svc.say(PATIENT, "jose@example.com").await;
        assert!(update.state.is_none());

        assert_eq!(
            transport.delivered_to(PATIENT).last(),
            Some(&replies::thank_you("José Pérez-López"))
        );
        let calls = svc.notifier.recorded_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.contains("jose@example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_menu_sent_after_delay() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        svc.say(PATIENT, "info").await;
        let asked = Instant::now();
        svc.say(PATIENT, "1").await;
        assert_eq!(
            transport.delivered_to(PATIENT).last().map(String::as_str),
            Some(replies::SESSION_INFO)
        );

        let update = svc.next_update().await;
        assert!(asked.elapsed() >= secs(10));
        assert_eq!(phase(&update), Some(Phase::MainMenu));
        assert_eq!(
            transport.delivered_to(PATIENT).last().map(String::as_str),
            Some(replies::SHORT_MENU)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_suppressed_after_leaving_menu() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        for body in ["info", "1", "2"] {
            svc.say(PATIENT, body).await;
        }

        // The follow-up still fires but finds the dialogue elsewhere
        let update = svc.next_update().await;
        assert_eq!(phase(&update), Some(Phase::CollectingName));
        let sent = transport.delivered_to(PATIENT);
        assert_eq!(sent.last().map(String::as_str), Some(replies::ASK_NAME));
        assert!(!sent.iter().any(|t| t == replies::SHORT_MENU));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_follow_up_replaces_older() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        svc.say(PATIENT, "info").await;
        svc.say(PATIENT, "1").await;
        tokio::time::sleep(secs(5)).await;
        let second = Instant::now();
        svc.say(PATIENT, "1").await;

        svc.next_update().await;
        assert!(second.elapsed() >= secs(10));
        tokio::time::sleep(secs(60)).await;

        let short_menus = transport
            .delivered_to(PATIENT)
            .iter()
            .filter(|t| *t == replies::SHORT_MENU)
            .count();
        assert_eq!(short_menus, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_menu_reset_cancels_pending_follow_up() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        svc.say(PATIENT, "info").await;
        svc.say(PATIENT, "1").await;
        for restart in ["hola", "info"] {
            let update = svc.say(PATIENT, restart).await;
            assert_eq!(phase(&update), Some(Phase::MainMenu));
        }

        tokio::time::sleep(secs(60)).await;
        let sent = transport.delivered_to(PATIENT);
        assert_eq!(sent.last().map(String::as_str), Some(replies::FULL_MENU));
        assert!(!sent.iter().any(|t| t == replies::SHORT_MENU));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_follow_ups() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;

        svc.say(PATIENT, "info").await;
        svc.say(PATIENT, "1").await;
        svc.service.shutdown().await;

        tokio::time::sleep(secs(60)).await;
        assert!(!transport
            .delivered_to(PATIENT)
            .iter()
            .any(|t| t == replies::SHORT_MENU));
        assert!(transport.was_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_error_apologizes_and_keeps_state() {
        let mut svc = TestService::builder().build();
        let transport = svc.ready().await;
        let nobody = "@c.us";

        svc.say(nobody, "info").await;
        svc.say(nobody, "2").await;
        let update = svc.say(nobody, "Ana Gómez").await;
        assert_eq!(
            update.state,
            Some(ConvState::AwaitingName {
                invalid_attempts: 0
            })
        );
        assert_eq!(
            transport.delivered_to(nobody).last().map(String::as_str),
            Some(replies::APOLOGY)
        );
        assert!(svc.notifier.recorded_calls().is_empty());
    }
}
