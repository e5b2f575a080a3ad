//! Pipelined requests: one task writes requests while another reads
//! replies, so round trips overlap.
//!
//! Replies come back in request order. The first socket failure on either
//! side is sticky: it is attached to the pair it happened on and to every
//! pair after it, and the receiver does not read the socket for any of
//! them. A reply that arrives intact but fails to decode only affects its
//! own pair.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rodsclient_proto::{Request, Response, XmlDialect};
use tokio::sync::mpsc;

use crate::channel::{receive_on, send_on, Channel, Reader, Writer};
use crate::connection::{decode, prepare, Connection};
use crate::error::{Result, TransportError};
use crate::framer::ProgressCallback;

/// Capacity of the queues between caller, sender and receiver.
pub const PIPELINE_DEPTH: usize = 100;

/// One request and the response it fills in.
pub struct RequestResponsePair<Rq, Rs> {
    pub request: Rq,
    pub response: Rs,
    /// Receives the reply's binary segment.
    pub bs_buffer: Option<Vec<u8>>,
    pub request_timeout: Option<Duration>,
    pub response_timeout: Option<Duration>,
    pub request_progress: Option<ProgressCallback>,
    pub response_progress: Option<ProgressCallback>,
    /// Set when this pair failed; shared by all pairs a sticky failure hit.
    pub error: Option<Arc<TransportError>>,
}

impl<Rq, Rs> RequestResponsePair<Rq, Rs> {
    pub fn new(request: Rq, response: Rs) -> Self {
        Self {
            request,
            response,
            bs_buffer: None,
            request_timeout: None,
            response_timeout: None,
            request_progress: None,
            response_progress: None,
            error: None,
        }
    }

    pub fn with_bs_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.bs_buffer = Some(buffer);
        self
    }

    pub fn with_timeouts(mut self, request: Duration, response: Duration) -> Self {
        self.request_timeout = Some(request);
        self.response_timeout = Some(response);
        self
    }
}

#[derive(Clone)]
struct Pipeline {
    channel: Channel,
    dialect: XmlDialect,
    default_timeout: Duration,
    sticky: Arc<OnceLock<Arc<TransportError>>>,
}

impl Pipeline {
    fn sticky(&self) -> Option<Arc<TransportError>> {
        self.sticky.get().cloned()
    }

    /// Records `err` as the sticky failure unless one is already set, and
    /// returns the one in effect.
    fn stick(&self, err: TransportError) -> Arc<TransportError> {
        let err = Arc::new(err);
        match self.sticky.set(Arc::clone(&err)) {
            Ok(()) => err,
            Err(_) => self.sticky().unwrap_or(err),
        }
    }

    async fn send_request(
        &self,
        writer: &mut Option<Writer>,
        request: &dyn Request,
        timeout: Option<Duration>,
        progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        let msg = prepare(&self.dialect, request)?;
        let socket = writer.as_mut().ok_or(TransportError::NotConnected)?;
        let timeout = timeout.unwrap_or(self.default_timeout);
        let sent = send_on(socket, &msg, timeout, progress, &self.channel.metrics).await;
        if let Err(e) = &sent {
            self.channel.mark_failed(e);
            *writer = None;
        }
        sent
    }

    async fn receive_pair<Rq, Rs>(&self, reader: &mut Option<Reader>, pair: &mut RequestResponsePair<Rq, Rs>) -> Result<()>
    where
        Rq: Request,
        Rs: Response,
    {
        let socket = reader.as_mut().ok_or(TransportError::NotConnected)?;
        let timeout = pair.response_timeout.unwrap_or(self.default_timeout);
        let received = receive_on(
            socket,
            pair.bs_buffer.as_deref_mut(),
            timeout,
            pair.response_progress.as_ref(),
            &self.channel.metrics,
        )
        .await;
        let msg = match received {
            Ok(msg) => msg,
            Err(e) => {
                self.channel.mark_failed(&e);
                *reader = None;
                return Err(e);
            }
        };
        decode(&self.dialect, msg, &mut pair.response, false)
    }
}

impl Connection {
    /// Sends every pair read from `input` and yields them, responses
    /// filled in or `error` set, in the same order.
    ///
    /// The sender and receiver hold the socket halves until `input` closes
    /// and every pair has been answered, so other requests on this
    /// connection wait until then.
    pub fn request_pipelined<Rq, Rs>(
        &self,
        input: mpsc::Receiver<RequestResponsePair<Rq, Rs>>,
    ) -> mpsc::Receiver<RequestResponsePair<Rq, Rs>>
    where
        Rq: Request + 'static,
        Rs: Response + 'static,
    {
        let (forward_tx, forward_rx) = mpsc::channel(PIPELINE_DEPTH);
        let (output_tx, output_rx) = mpsc::channel(PIPELINE_DEPTH);
        let pipeline = Pipeline {
            channel: self.channel().clone(),
            dialect: self.dialect(),
            default_timeout: self.config().operation_timeout(),
            sticky: Arc::new(OnceLock::new()),
        };

        tokio::spawn(send_loop(pipeline.clone(), input, forward_tx));
        tokio::spawn(receive_loop(pipeline, forward_rx, output_tx));
        output_rx
    }
}

async fn send_loop<Rq, Rs>(
    pipeline: Pipeline,
    mut input: mpsc::Receiver<RequestResponsePair<Rq, Rs>>,
    forward: mpsc::Sender<RequestResponsePair<Rq, Rs>>,
) where
    Rq: Request,
    Rs: Response,
{
    let mut writer = Arc::clone(&pipeline.channel.writer).lock_owned().await;
    while let Some(mut pair) = input.recv().await {
        if let Some(err) = pipeline.sticky() {
            pair.error = Some(err);
        } else if let Err(e) = pipeline
            .send_request(
                &mut writer,
                &pair.request,
                pair.request_timeout,
                pair.request_progress.as_ref(),
            )
            .await
        {
            tracing::debug!(error = %e, "pipelined send failed");
            pipeline.channel.metrics.inc_request_failures();
            pair.error = Some(pipeline.stick(e));
        }
        if forward.send(pair).await.is_err() {
            break;
        }
    }
}

async fn receive_loop<Rq, Rs>(
    pipeline: Pipeline,
    mut forwarded: mpsc::Receiver<RequestResponsePair<Rq, Rs>>,
    output: mpsc::Sender<RequestResponsePair<Rq, Rs>>,
) where
    Rq: Request,
    Rs: Response,
{
    let mut reader = Arc::clone(&pipeline.channel.reader).lock_owned().await;
    // Pairs that went out before a send failure still have replies on the
    // wire, so only a failed read stops the reading.
    let mut read_failure: Option<Arc<TransportError>> = None;
    while let Some(mut pair) = forwarded.recv().await {
        if pair.error.is_none() {
            if let Some(err) = &read_failure {
                pair.error = Some(Arc::clone(err));
            } else if let Err(e) = pipeline.receive_pair(&mut reader, &mut pair).await {
                tracing::debug!(error = %e, "pipelined receive failed");
                pipeline.channel.metrics.inc_response_failures();
                if e.is_transport_failure() {
                    let err = pipeline.stick(e);
                    read_failure = Some(Arc::clone(&err));
                    pair.error = Some(err);
                } else {
                    pair.error = Some(Arc::new(e));
                }
            }
        }
        if output.send(pair).await.is_err() {
            break;
        }
    }
}
