//! Signaling transports
//!
//! A [`Connector`] opens a [`Link`] to one endpoint. A link is a pair of text
//! channels: writes go to `outbound`, and `inbound` yields received messages
//! until the connection closes (then `recv()` returns `None`). A failed write
//! on `outbound` also means the link is gone.
//!
//! [`TcpConnector`] speaks newline-delimited JSON over TCP.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::Result;

/// One established signaling connection
#[derive(Debug)]
pub struct Link {
    /// Messages to write to the peer
    pub outbound: mpsc::UnboundedSender<String>,
    /// Messages received from the peer
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Two links wired back to back (in-process transport)
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Opens signaling links
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `endpoint`
    async fn connect(&self, endpoint: &str) -> Result<Link>;
}

/// Newline-delimited JSON over TCP (`host:port` endpoints)
#[derive(Debug, Clone)]
pub struct TcpConnector {
    max_message_size: usize,
}

impl TcpConnector {
    /// Create a connector that drops the connection on lines longer than `max_message_size`
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(256 * 1024)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Link> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let max_message_size = self.max_message_size;
        let peer = endpoint.to_string();

        let read_task = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(8 * 1024);
            // Bytes before this offset are known to hold no newline
            let mut scanned = 0;
            loop {
                while let Some(offset) = buf[scanned..].iter().position(|b| *b == b'\n') {
                    let pos = scanned + offset;
                    scanned = 0;
                    if pos > max_message_size {
                        tracing::warn!(
                            endpoint = %peer,
                            length = pos,
                            limit = max_message_size,
                            "Inbound message too large, closing"
                        );
                        return;
                    }

                    let line = buf.split_to(pos + 1).freeze();
                    match std::str::from_utf8(&line[..pos]) {
                        Ok(text) => {
                            let text = text.trim_end_matches('\r');
                            if text.is_empty() {
                                continue;
                            }
                            if in_tx.send(text.to_owned()).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(endpoint = %peer, error = %e, "Dropping non UTF-8 line");
                        }
                    }
                }
                scanned = buf.len();

                if buf.len() > max_message_size {
                    tracing::warn!(
                        endpoint = %peer,
                        buffered = buf.len(),
                        limit = max_message_size,
                        "Inbound message too large, closing"
                    );
                    return;
                }

                match reader.read_buf(&mut buf).await {
                    Ok(0) => return,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(endpoint = %peer, error = %e, "Read failed");
                        return;
                    }
                }
            }
        });

        let reader_abort = read_task.abort_handle();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                let mut frame = text.into_bytes();
                frame.push(b'\n');
                if let Err(e) = writer.write_all(&frame).await {
                    tracing::debug!(error = %e, "Write failed");
                    break;
                }
            }
            // Ending the reader closes `inbound`, which the channel sees as a drop
            reader_abort.abort();
            let _ = writer.shutdown().await;
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
