//! Byte-oriented transport seam.
//!
//! The sync client only sees [`Transport`] (send/close) and
//! [`TransportHandler`] (open/message/close callbacks). The bundled
//! implementation speaks WebSocket and reconnects on a schedule; tests plug
//! in an in-memory connector.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::schedule::{exponential, Next, Schedule, ScheduleDeps, Step};

/// An established (or establishing) connection.
pub trait Transport: Send + Sync {
    /// Queue a binary payload. Payloads sent while the connection is down
    /// are dropped; anti-entropy recovers them after reconnect.
    fn send(&self, payload: Vec<u8>);

    /// Close the connection permanently.
    fn close(&self);
}

/// Callbacks a connection drives. Only binary frames are delivered; text
/// frames are ignored.
pub trait TransportHandler: Send + Sync {
    fn on_open(&self);
    fn on_message(&self, payload: Vec<u8>);
    fn on_close(&self);
}

/// Creates transports for URLs.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str, handler: Arc<dyn TransportHandler>) -> Arc<dyn Transport>;
}

enum Command {
    Send(Vec<u8>),
    Close,
}

/// WebSocket connector with schedule-driven reconnection.
pub struct WebSocketConnector {
    deps: ScheduleDeps,
    reconnect: Schedule<(), u64>,
}

impl WebSocketConnector {
    /// Reconnect forever on capped, jittered exponential backoff, restarted
    /// after every successful connection.
    pub fn new(deps: ScheduleDeps) -> Self {
        Self {
            deps,
            reconnect: exponential(100).max_delay(20_000).jitter(1.0),
        }
    }

    /// Use a custom reconnect schedule.
    pub fn with_reconnect(deps: ScheduleDeps, reconnect: Schedule<(), u64>) -> Self {
        Self { deps, reconnect }
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, url: &str, handler: Arc<dyn TransportHandler>) -> Arc<dyn Transport> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(
            url.to_string(),
            handler,
            rx,
            self.deps.clone(),
            self.reconnect.clone(),
        ));
        Arc::new(WebSocketTransport { tx })
    }
}

struct WebSocketTransport {
    tx: mpsc::UnboundedSender<Command>,
}

impl Transport for WebSocketTransport {
    fn send(&self, payload: Vec<u8>) {
        let _ = self.tx.send(Command::Send(payload));
    }

    fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}

async fn run_connection(
    url: String,
    handler: Arc<dyn TransportHandler>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    deps: ScheduleDeps,
    reconnect: Schedule<(), u64>,
) {
    let mut backoff = reconnect.step(&deps);

    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                tracing::debug!(%url, "transport connected");
                // A successful connection restarts the backoff.
                backoff = reconnect.step(&deps);
                handler.on_open();

                let (mut sink, mut stream) = socket.split();
                loop {
                    tokio::select! {
                        command = commands.recv() => match command {
                            Some(Command::Send(payload)) => {
                                if sink.send(Message::Binary(payload)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Command::Close) | None => {
                                let _ = sink.send(Message::Close(None)).await;
                                handler.on_close();
                                return;
                            }
                        },
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Binary(payload))) => handler.on_message(payload),
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                tracing::debug!(%url, %err, "transport error");
                                break;
                            }
                            None => break,
                        },
                    }
                }
                handler.on_close();
            }
            Err(err) => {
                tracing::debug!(%url, %err, "transport connect failed");
            }
        }

        if !wait_for_reconnect(&mut backoff, &mut commands, &handler).await {
            return;
        }
    }
}

/// Sleep out the backoff delay, still honoring a close command. Returns
/// whether the connection should be retried.
async fn wait_for_reconnect(
    backoff: &mut Step<(), u64>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    handler: &Arc<dyn TransportHandler>,
) -> bool {
    let delay = match backoff(&()) {
        Next::Continue { delay, .. } => delay,
        Next::Done => {
            handler.on_close();
            return false;
        }
    };

    let sleep = tokio::time::sleep(std::time::Duration::from_millis(delay));
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(Command::Send(_)) => {} // dropped while disconnected
                Some(Command::Close) | None => {
                    handler.on_close();
                    return false;
                }
            },
        }
    }
}
