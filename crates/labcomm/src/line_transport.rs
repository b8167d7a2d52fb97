//! NDJSON channel transport over a byte stream.
//!
//! One envelope per line in both directions. A writer task drains the
//! outbound queue; a reader task parses inbound lines and forwards them to
//! the receiver returned by [`LineTransport::spawn`]. Lines that fail to
//! parse, including ones that are not UTF-8, are logged and skipped.

use std::sync::Mutex;

use labcomm_protocol::Envelope;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::CommTransport;
use crate::lock;

pub struct LineTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LineTransport {
    /// Start the reader and writer tasks. Must be called inside a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W) -> (Self, mpsc::UnboundedReceiver<Envelope>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_lines(writer, out_rx));
        let reader = tokio::spawn(read_lines(reader, in_tx));

        (
            Self {
                outbound: Mutex::new(Some(out_tx)),
                reader: Mutex::new(Some(reader)),
            },
            in_rx,
        )
    }
}

impl CommTransport for LineTransport {
    fn send(&self, envelope: &Envelope) -> Result<(), String> {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx
                .send(envelope.clone())
                .map_err(|_| "writer stopped".to_string()),
            None => Err("transport closed".to_string()),
        }
    }

    fn close(&self) {
        // Dropping the sender lets the writer flush and shut down
        lock(&self.outbound).take();
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

async fn write_lines<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        let line = match envelope.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("[labcomm-line] Failed to serialize {}: {}", envelope.action, e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("[labcomm-line] Write failed: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!("[labcomm-line] Flush failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
    debug!("[labcomm-line] Writer finished");
}

async fn read_lines<R>(reader: R, inbound: mpsc::UnboundedSender<Envelope>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("[labcomm-line] Read failed: {}", e);
                break;
            }
        }
        if is_blank(&line) {
            continue;
        }
        match Envelope::from_slice(&line) {
            Ok(envelope) => {
                if inbound.send(envelope).is_err() {
                    break;
                }
            }
            Err(e) => warn!("[labcomm-line] Skipping malformed line: {}", e),
        }
    }
    debug!("[labcomm-line] Reader finished");
}

pub(crate) fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}
