//! Relay transport
//!
//! Talks newline-delimited JSON to a local relay process that owns the actual
//! messaging session. One TCP connection per transport handle.

use crate::runtime::{
    SessionSpec, Transport, TransportConnector, TransportError, TransportErrorKind,
    TransportEvents,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Frames sent to the relay
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutFrame<'a> {
    Hello {
        session_id: &'a str,
        credentials_dir: &'a Path,
    },
    Reply {
        to: &'a str,
        body: &'a str,
    },
    DirectSend {
        to: &'a str,
        body: &'a str,
    },
    Logout,
}

/// Frames received from the relay
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InFrame {
    Ready,
    Message {
        from: String,
        body: String,
    },
    BootstrapCode {
        code: String,
    },
    AuthFailure {
        message: String,
    },
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
}

fn parse_frame(line: &str) -> Result<InFrame, TransportError> {
    serde_json::from_str(line).map_err(|e| TransportError::protocol(format!("bad frame: {e}")))
}

fn encode_frame(frame: &OutFrame<'_>) -> Result<String, TransportError> {
    let mut line = serde_json::to_string(frame)
        .map_err(|e| TransportError::protocol(format!("cannot encode frame: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Creates relay transports for a fixed relay address
pub struct RelayConnector {
    addr: String,
}

impl RelayConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl TransportConnector for RelayConnector {
    fn create(
        &self,
        spec: &SessionSpec,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(RelayTransport {
            addr: self.addr.clone(),
            spec: spec.clone(),
            events,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        }))
    }
}

pub struct RelayTransport {
    addr: String,
    spec: SessionSpec,
    events: TransportEvents,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RelayTransport {
    async fn write(&self, frame: &OutFrame<'_>) -> Result<(), TransportError> {
        let line = encode_frame(frame)?;
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(TransportError::not_connected());
        };
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Forward a relay frame; `Ready` has no event counterpart
async fn forward(events: &TransportEvents, frame: InFrame) {
    match frame {
        InFrame::Ready => {}
        InFrame::Message { from, body } => events.message(from, body).await,
        InFrame::BootstrapCode { code } => events.bootstrap_code(code).await,
        InFrame::AuthFailure { message } => events.auth_failure(message).await,
        InFrame::Disconnected { reason } => {
            events
                .disconnected(reason.unwrap_or_else(|| "relay reported disconnection".to_string()))
                .await;
        }
    }
}

async fn read_events(mut lines: Lines<BufReader<OwnedReadHalf>>, events: TransportEvents) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match parse_frame(&line) {
                Ok(InFrame::Disconnected { reason }) => {
                    forward(&events, InFrame::Disconnected { reason }).await;
                    return;
                }
                Ok(frame) => forward(&events, frame).await,
                Err(e) => tracing::warn!(error = %e, "Skipping relay frame"),
            },
            Ok(None) => {
                events.disconnected("relay closed the connection").await;
                return;
            }
            Err(e) => {
                events.disconnected(format!("relay read failed: {e}")).await;
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (read, write) = stream.into_split();
        *self.writer.lock().await = Some(write);

        self.write(&OutFrame::Hello {
            session_id: &self.spec.session_id,
            credentials_dir: &self.spec.credentials_dir,
        })
        .await?;

        // Bootstrap codes and auth failures can arrive before the session is ready
        let mut lines = BufReader::new(read).lines();
        loop {
            let Some(line) = lines.next_line().await? else {
                return Err(TransportError::closed("relay closed before ready"));
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_frame(&line) {
                Ok(InFrame::Ready) => break,
                Ok(InFrame::Disconnected { reason }) => {
                    return Err(TransportError::rejected(
                        reason.unwrap_or_else(|| "relay refused the session".to_string()),
                    ));
                }
                Ok(frame) => forward(&self.events, frame).await,
                Err(e) => tracing::warn!(error = %e, "Skipping relay frame"),
            }
        }

        let task = tokio::spawn(read_events(lines, self.events.clone()));
        if let Some(previous) = self.reader.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        // Logout is best-effort; the socket closes either way
        let logout = self.write(&OutFrame::Logout).await;
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        match logout {
            Err(e) if e.kind != TransportErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    async fn send(&self, to: &str, text: &str) -> Result<(), TransportError> {
        self.write(&OutFrame::Reply { to, body: text }).await
    }

    async fn send_direct(&self, to: &str, text: &str) -> Result<(), TransportError> {
        self.write(&OutFrame::DirectSend { to, body: text }).await
    }
}
