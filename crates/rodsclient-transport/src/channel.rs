//! The socket behind a connection, split into halves that the connection
//! and the pipeline workers lock independently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rodsclient_proto::Message;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::framer::{read_message, with_deadline, write_message, BoxedStream, ProgressCallback};
use crate::metrics::ConnectionMetrics;

pub(crate) type Reader = ReadHalf<BoxedStream>;
pub(crate) type Writer = WriteHalf<BoxedStream>;

#[derive(Clone)]
pub(crate) struct Channel {
    pub(crate) reader: Arc<Mutex<Option<Reader>>>,
    pub(crate) writer: Arc<Mutex<Option<Writer>>>,
    failed: Arc<AtomicBool>,
    pub(crate) metrics: Arc<ConnectionMetrics>,
}

impl Channel {
    pub(crate) fn new(metrics: Arc<ConnectionMetrics>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(None)),
            failed: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    pub(crate) async fn attach(&self, stream: BoxedStream) {
        let (read, write) = tokio::io::split(stream);
        *self.reader.lock().await = Some(read);
        *self.writer.lock().await = Some(write);
        self.failed.store(false, Ordering::SeqCst);
    }

    /// Takes the stream out so it can be wrapped, e.g. in TLS.
    pub(crate) async fn detach(&self) -> Result<BoxedStream> {
        let read = self.reader.lock().await.take();
        let write = self.writer.lock().await.take();
        match (read, write) {
            (Some(read), Some(write)) => Ok(read.unsplit(write)),
            _ => Err(TransportError::NotConnected),
        }
    }

    pub(crate) async fn is_attached(&self) -> bool {
        self.writer.lock().await.is_some() && self.reader.lock().await.is_some()
    }

    /// Shuts down the write side and drops both halves.
    pub(crate) async fn close(&self) -> Result<()> {
        let write = self.writer.lock().await.take();
        let read = self.reader.lock().await.take();
        let result = match write {
            Some(mut w) => w.shutdown().await.map_err(TransportError::from),
            None => Ok(()),
        };
        drop(read);
        result
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Records a socket failure. The connection is unusable afterwards.
    pub(crate) fn mark_failed(&self, err: &TransportError) {
        if matches!(err, TransportError::Timeout { .. }) {
            self.metrics.inc_timeouts();
        }
        if !self.failed.swap(true, Ordering::SeqCst) {
            self.metrics.inc_connection_failures();
            tracing::warn!(error = %err, "connection failed");
        }
    }

    pub(crate) async fn send(
        &self,
        msg: &Message,
        timeout: Duration,
        progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let result = match guard.as_mut() {
            Some(writer) => send_on(writer, msg, timeout, progress, &self.metrics).await,
            None => return Err(TransportError::NotConnected),
        };
        if let Err(e) = &result {
            self.mark_failed(e);
            *guard = None;
        }
        result
    }

    pub(crate) async fn receive(
        &self,
        bs_buffer: Option<&mut [u8]>,
        timeout: Duration,
        progress: Option<&ProgressCallback>,
    ) -> Result<Message> {
        let mut guard = self.reader.lock().await;
        let result = match guard.as_mut() {
            Some(reader) => receive_on(reader, bs_buffer, timeout, progress, &self.metrics).await,
            None => return Err(TransportError::NotConnected),
        };
        if let Err(e) = &result {
            self.mark_failed(e);
            *guard = None;
        }
        result
    }
}

/// Sends one frame on an already locked writer.
pub(crate) async fn send_on(
    writer: &mut Writer,
    msg: &Message,
    timeout: Duration,
    progress: Option<&ProgressCallback>,
    metrics: &ConnectionMetrics,
) -> Result<()> {
    let written = with_deadline(timeout, "send", write_message(writer, msg, progress)).await?;
    metrics.add_bytes_sent(written);
    metrics.inc_requests_sent();
    Ok(())
}

/// Reads one frame from an already locked reader.
pub(crate) async fn receive_on(
    reader: &mut Reader,
    bs_buffer: Option<&mut [u8]>,
    timeout: Duration,
    progress: Option<&ProgressCallback>,
    metrics: &ConnectionMetrics,
) -> Result<Message> {
    let (msg, read) = with_deadline(timeout, "receive", read_message(reader, bs_buffer, progress)).await?;
    metrics.add_bytes_received(read);
    metrics.inc_responses_received();
    Ok(msg)
}
