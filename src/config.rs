//! Process configuration, read from the environment

use crate::runtime::SessionSpec;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SESSION_ID: &str = "intake-bot-main";
const DEFAULT_SESSION_DIR: &str = "./sessions";
const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:7400";

/// Timeouts and backoffs for the session lifecycle and dispatcher
#[derive(Debug, Clone)]
pub struct Timings {
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Backoff after a failed or timed-out connect
    pub connect_retry_delay: Duration,
    /// Backoff after the transport reports a disconnection
    pub disconnect_retry_delay: Duration,
    /// Bound on transport teardown; the handle is abandoned after it
    pub teardown_timeout: Duration,
    /// Bound on each reply send attempt
    pub send_timeout: Duration,
    /// Bound on each notification gateway call
    pub notify_timeout: Duration,
    /// Delay before the short menu follows the info reply
    pub follow_up_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            connect_retry_delay: Duration::from_secs(30),
            disconnect_retry_delay: Duration::from_secs(20),
            teardown_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            notify_timeout: Duration::from_secs(15),
            follow_up_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Stable session id; reused on every reconnect so stored credentials stay valid
    pub session_id: String,
    /// Parent directory for per-session credential directories
    pub session_dir: PathBuf,
    /// Address of the messaging relay
    pub relay_addr: String,
    /// Webhook for notifications; log-only when unset
    pub notify_url: Option<String>,
    pub timings: Timings,
}

impl Config {
    pub fn from_env() -> Self {
        let mut timings = Timings::default();
        timings.connect_timeout = env_secs("INTAKE_CONNECT_TIMEOUT_SECS", timings.connect_timeout);
        timings.notify_timeout = env_secs("INTAKE_NOTIFY_TIMEOUT_SECS", timings.notify_timeout);

        Self {
            session_id: std::env::var("INTAKE_SESSION_ID")
                .ok()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string()),
            session_dir: std::env::var("INTAKE_SESSION_DIR")
                .map_or_else(|_| PathBuf::from(DEFAULT_SESSION_DIR), PathBuf::from),
            relay_addr: std::env::var("INTAKE_RELAY_ADDR")
                .unwrap_or_else(|_| DEFAULT_RELAY_ADDR.to_string()),
            notify_url: std::env::var("INTAKE_NOTIFY_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            timings,
        }
    }

    pub fn session_spec(&self) -> SessionSpec {
        SessionSpec::new(&self.session_id, &self.session_dir)
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}
