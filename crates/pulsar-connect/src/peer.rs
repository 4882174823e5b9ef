//! PeerClient: one connection to one Star

use futures::{SinkExt, StreamExt};
use pulsar_proto::{Batch, ClientCodec, JobReport, ProtoError, Request, Response, MAX_FRAME_LEN};
use pulsar_resilience::{CircuitBreaker, CircuitBreakerConfig};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::error::ConnectError;

type Connection = Framed<TcpStream, ClientCodec>;

/// Time a Star gets to answer one request unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A connection to a Star.
///
/// Calls are sequential on the underlying TCP stream. A broken connection is
/// dropped and transparently re-established on the next call, which is what
/// lets [`PeerClient::submit_batch`] retry across a peer restart.
///
/// ```rust,no_run
/// use pulsar_connect::PeerClient;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), pulsar_connect::ConnectError> {
/// let star = PeerClient::connect("10.0.0.5:1234", Duration::from_secs(5)).await?;
/// let reply = star.submit_job("alice", "/data/src", "/data/dst").await?;
/// println!("{reply}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PeerClient {
    address: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    max_frame_len: usize,
    conn: Mutex<Option<Connection>>,
    breaker: CircuitBreaker,
}

impl PeerClient {
    /// Connects with a private breaker that never retries.
    pub async fn connect(
        address: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let address = address.into();
        let breaker = CircuitBreaker::new(
            address.clone(),
            CircuitBreakerConfig {
                retry: pulsar_resilience::RetryPolicy::no_retry(),
                ..Default::default()
            },
        );
        let client = Self::new(address, connect_timeout, breaker);
        client.ensure_connected().await?;
        Ok(client)
    }

    /// Creates an unconnected client sharing `breaker` with other clients of
    /// the same peer.
    pub fn new(address: impl Into<String>, connect_timeout: Duration, breaker: CircuitBreaker) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_len: MAX_FRAME_LEN,
            conn: Mutex::new(None),
            breaker,
        }
    }

    /// Bounds the wait for each response.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Largest request frame this client sends. Takes effect on the next connect.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Opens the connection if it is not open yet.
    pub async fn ensure_connected(&self) -> Result<(), ConnectError> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.open().await?);
        }
        Ok(())
    }

    async fn open(&self) -> Result<Connection, ConnectError> {
        debug!(peer = %self.address, "Connecting");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| ConnectError::Timeout {
                address: self.address.clone(),
            })?
            .map_err(|e| ConnectError::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
        stream
            .set_nodelay(true)
            .map_err(|e| ConnectError::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;

        Ok(Framed::new(
            stream,
            ClientCodec::with_max_frame_len(self.max_frame_len),
        ))
    }

    /// Sends one request and waits for its response. No retry.
    ///
    /// A peer that does not answer within the request timeout gets its
    /// connection dropped and the call fails with [`ConnectError::Timeout`].
    pub async fn call(&self, request: Request) -> Result<Response, ConnectError> {
        let op = request.op();
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.open().await?);
        }
        let Some(framed) = conn.as_mut() else {
            return Err(ConnectError::Protocol {
                address: self.address.clone(),
                source: ProtoError::Closed,
            });
        };

        trace!(peer = %self.address, op, "Sending request");
        match tokio::time::timeout(self.request_timeout, exchange(framed, request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => {
                // The stream may be mid-frame; never reuse it
                *conn = None;
                Err(ConnectError::Protocol {
                    address: self.address.clone(),
                    source,
                })
            }
            Err(_) => {
                warn!(
                    peer = %self.address,
                    op,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "No response, dropping connection"
                );
                *conn = None;
                Err(ConnectError::Timeout {
                    address: self.address.clone(),
                })
            }
        }
    }

    /// Sends a request under the peer's breaker, retrying transient failures.
    ///
    /// An `Error` response from the Star is a permanent failure.
    pub async fn call_with_retry(&self, request: Request) -> Result<Response, ConnectError> {
        self.breaker
            .execute(|| {
                let request = request.clone();
                async move {
                    match self.call(request).await {
                        Ok(Response::Error { message }) => Err(ConnectError::Rejected {
                            address: self.address.clone(),
                            message,
                        }
                        .into_resilience()),
                        Ok(response) => Ok(response),
                        Err(e) => Err(e.into_resilience()),
                    }
                }
            })
            .await
            .map_err(|source| ConnectError::Dispatch {
                address: self.address.clone(),
                source,
            })
    }

    /// Hands a batch to the Star's ingestion queue.
    pub async fn submit_batch(&self, batch: Batch) -> Result<(), ConnectError> {
        let paths = batch.len();
        match self.call_with_retry(Request::SubmitBatch { batch }).await? {
            Response::Ack { .. } => {
                debug!(peer = %self.address, paths, "Batch acknowledged");
                Ok(())
            }
            _ => Err(self.unexpected("submit_batch")),
        }
    }

    /// Submits a job; returns the Star's reply (`"Jobid: N"` or `"Error: ..."`).
    pub async fn submit_job(
        &self,
        user: impl Into<String>,
        src: impl Into<String>,
        dst: impl Into<String>,
    ) -> Result<String, ConnectError> {
        let request = Request::SubmitJob {
            user: user.into(),
            src: src.into(),
            dst: dst.into(),
        };
        match self.call(request).await? {
            Response::Submitted { reply } => Ok(reply),
            Response::Error { message } => Err(self.rejected(message)),
            _ => Err(self.unexpected("submit_job")),
        }
    }

    pub async fn job_status(&self, job_id: u64) -> Result<JobReport, ConnectError> {
        match self.call(Request::GetJobStatus { job_id }).await? {
            Response::Status { job } => Ok(job),
            Response::Error { message } => Err(self.rejected(message)),
            _ => Err(self.unexpected("get_job_status")),
        }
    }

    pub async fn cancel_job(&self, job_id: u64) -> Result<String, ConnectError> {
        match self.call(Request::CancelJob { job_id }).await? {
            Response::Cancelled { reply } => Ok(reply),
            Response::Error { message } => Err(self.rejected(message)),
            _ => Err(self.unexpected("cancel_job")),
        }
    }

    fn rejected(&self, message: String) -> ConnectError {
        ConnectError::Rejected {
            address: self.address.clone(),
            message,
        }
    }

    fn unexpected(&self, op: &'static str) -> ConnectError {
        ConnectError::UnexpectedResponse {
            address: self.address.clone(),
            op,
        }
    }
}

async fn exchange(framed: &mut Connection, request: Request) -> Result<Response, ProtoError> {
    framed.send(request).await?;
    match framed.next().await {
        Some(response) => response,
        None => Err(ProtoError::Closed),
    }
}
