//! WebSocket link from a session to the relay.
//!
//! Provides:
//! - Connection setup against `<relay_url>/<room>`
//! - A writer task fed by an outgoing channel
//! - A reader task that decodes frames into [`LinkEvent`]s
//!
//! The link knows nothing about documents. It moves [`SyncMessage`]s and
//! reports when the socket goes away.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientId, ProtocolError, SyncMessage};

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Synchronized,
}

/// What the reader task reports.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(SyncMessage),
    Closed,
}

/// An open relay connection.
pub struct RelayLink {
    client: ClientId,
    outgoing_tx: mpsc::Sender<String>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RelayLink {
    /// Connect to `url` and spawn the reader/writer tasks.
    ///
    /// Messages stamped with `client` are never delivered back.
    pub async fn connect(
        url: &str,
        client: ClientId,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<LinkEvent>), ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(capacity);
        let (event_tx, event_rx) = mpsc::channel::<LinkEvent>(capacity);

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                    log::error!("Relay write failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SyncMessage::decode(text.as_str()) {
                        Ok(msg) if msg.client() == client => {
                            log::debug!("Skipping own {} echoed by relay", msg.kind());
                        }
                        Ok(msg) => {
                            if event_tx.send(LinkEvent::Message(msg)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Binary(data)) => {
                        log::warn!("{}", ProtocolError::BinaryFrame(data.len()));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Relay read failed: {e}");
                        break;
                    }
                }
            }
            let _ = event_tx.send(LinkEvent::Closed).await;
        });

        log::info!("Connected to relay at {url}");
        Ok((
            Self {
                client,
                outgoing_tx: out_tx,
                writer,
                reader,
            },
            event_rx,
        ))
    }

    /// Queue a message for the writer task.
    pub async fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let text = msg.encode()?;
        log::debug!("→ {} ({} bytes)", msg.kind(), text.len());
        self.outgoing_tx
            .send(text)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Whether both tasks are still running.
    pub fn is_open(&self) -> bool {
        !self.writer.is_finished() && !self.reader.is_finished()
    }

    /// Flush queued messages and close the socket.
    pub async fn close(self) {
        let Self {
            outgoing_tx,
            writer,
            reader,
            ..
        } = self;
        drop(outgoing_tx);
        let _ = writer.await;
        reader.abort();
    }
}
