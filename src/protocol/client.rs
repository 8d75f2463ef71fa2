//! Calling side of a protocol connection
//!
//! [`RemoteBox`] hands out nonces, keeps a table of pending calls keyed by
//! nonce, and runs a reader task that hands each response to the first
//! pending call on its nonce that accepts the response's kind. The `error`
//! kind is accepted by every call. Calls that time out are removed from the
//! table.

use super::{Frame, Nonce, Request, Response, ResponseKind, WireFormat};
use crate::config::ClientConfig;
use crate::error::{Error, Result, TaskError};
use crate::types::{
    DownloadRequest, DownloadResponse, FeatureSet, ListenCondition, ProxyConfig, TaskId, TaskInfo,
    TaskOutput,
};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{HeaderValue, header},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Frames queued for the writer task
const OUTBOUND_CAPACITY: usize = 16;

/// Outcome of a listened-for download
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The task finished with an output
    Success {
        /// Task ID
        task_id: TaskId,
        /// Task URL
        url: String,
        /// Command line of the last attempt
        command_line: Vec<String>,
        /// Output bytes (empty when downloaded without data) and MIME type
        output: TaskOutput,
        /// Log lines of the last attempt
        logs: Vec<String>,
    },
    /// The task failed
    Failure {
        /// Task ID
        task_id: TaskId,
        /// Task URL
        url: String,
        /// Command line of the last attempt
        command_line: Vec<String>,
        /// Log lines of the last attempt
        logs: Vec<String>,
        /// Classified error, if the tool failed
        error: Option<TaskError>,
    },
}

struct Pending {
    accepts: &'static [ResponseKind],
    respond_to: oneshot::Sender<Response>,
}

type PendingTable = Arc<Mutex<HashMap<Nonce, Vec<Pending>>>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<Nonce, Vec<Pending>>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Client for a remote download box
pub struct RemoteBox {
    format: WireFormat,
    request_timeout: Duration,
    download_timeout: Duration,
    outbound: mpsc::Sender<Frame>,
    pending: PendingTable,
    nonce_base: u64,
    counter: AtomicU32,
    cancel: CancellationToken,
}

impl RemoteBox {
    /// Open a websocket to a box's `/connect` endpoint
    ///
    /// The `Accept` header announces the configured wire format and the API
    /// key, when set, is sent as a bearer token.
    pub async fn connect(url: &str, config: ClientConfig) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::WebSocket(format!("invalid url {url}: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(config.format.content_type()),
        );
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| Error::InvalidRequest(format!("invalid api key: {e}")))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        debug!(url, format = ?config.format, "Connected to remote box");

        let (sink, stream) = socket.split();
        let inbound = stream
            .take_while(|message| {
                future::ready(matches!(message, Ok(message) if !message.is_close()))
            })
            .filter_map(|message| {
                future::ready(match message {
                    Ok(tungstenite::Message::Text(text)) => Some(Frame::Text(text)),
                    Ok(tungstenite::Message::Binary(bytes)) => Some(Frame::Binary(bytes)),
                    _ => None,
                })
            });
        let outbound = sink.with(|frame: Frame| {
            future::ready(Ok::<_, tungstenite::Error>(match frame {
                Frame::Text(text) => tungstenite::Message::Text(text),
                Frame::Binary(bytes) => tungstenite::Message::Binary(bytes),
            }))
        });

        Ok(Self::new(config, inbound, outbound))
    }

    /// Run a client over an existing frame transport
    pub fn new<S, K>(config: ClientConfig, inbound: S, outbound: K) -> Self
    where
        S: Stream<Item = Frame> + Unpin + Send + 'static,
        K: Sink<Frame> + Unpin + Send + 'static,
        K::Error: Display,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let pending = PendingTable::default();
        let cancel = CancellationToken::new();

        tokio::spawn(write_frames(rx, outbound, cancel.clone()));
        tokio::spawn(read_responses(
            config.format,
            inbound,
            pending.clone(),
            cancel.clone(),
        ));

        Self {
            format: config.format,
            request_timeout: config.request_timeout,
            download_timeout: config.download_timeout,
            outbound: tx,
            pending,
            nonce_base: u64::from(rand::random::<u32>()) << 32,
            counter: AtomicU32::new(0),
            cancel,
        }
    }

    /// Whether the connection is still usable
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn next_nonce(&self) -> Nonce {
        self.nonce_base | u64::from(self.counter.fetch_add(1, Ordering::Relaxed))
    }

    async fn call(
        &self,
        build: impl FnOnce(Nonce) -> Request,
        accepts: &'static [ResponseKind],
        timeout: Duration,
    ) -> Result<Response> {
        if !self.is_connected() {
            return Err(Error::SessionClosed);
        }

        let nonce = self.next_nonce();
        let frame = self.format.encode(&build(nonce))?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).entry(nonce).or_default().push(Pending {
            accepts,
            respond_to: tx,
        });

        if self.outbound.send(frame).await.is_err() {
            self.forget(nonce);
            return Err(Error::SessionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Response::Error { message, .. })) => Err(Error::Protocol(message)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => {
                self.forget(nonce);
                warn!(nonce, after_ms = timeout.as_millis() as u64, "Remote call timed out");
                Err(Error::Timeout {
                    nonce,
                    after: timeout,
                })
            }
        }
    }

    fn forget(&self, nonce: Nonce) {
        lock(&self.pending).remove(&nonce);
    }

    /// Start (or attach to) a download without waiting for it
    pub async fn begin_download(&self, request: DownloadRequest) -> Result<DownloadResponse> {
        let response = self
            .call(
                |nonce| Request::Download {
                    nonce,
                    request,
                    listen_for: ListenCondition::DoNotListen,
                },
                &[ResponseKind::Downloading],
                self.request_timeout,
            )
            .await?;

        match response {
            Response::Downloading {
                task_id,
                created,
                url,
                args,
                ..
            } => Ok(DownloadResponse {
                id: task_id,
                created,
                url,
                args,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Download and wait for the outcome, output bytes included
    pub async fn download_with_data(&self, request: DownloadRequest) -> Result<DownloadOutcome> {
        self.download(request, ListenCondition::ListenWithData).await
    }

    /// Download and wait for the outcome, without the output bytes
    pub async fn download_without_data(&self, request: DownloadRequest) -> Result<DownloadOutcome> {
        self.download(request, ListenCondition::ListenNoData).await
    }

    async fn download(
        &self,
        request: DownloadRequest,
        listen_for: ListenCondition,
    ) -> Result<DownloadOutcome> {
        // The Downloading acknowledgement shares the nonce and is skipped
        let response = self
            .call(
                |nonce| Request::Download {
                    nonce,
                    request,
                    listen_for,
                },
                &[ResponseKind::DownloadSuccess, ResponseKind::DownloadFailure],
                self.download_timeout,
            )
            .await?;

        match response {
            Response::DownloadSuccess {
                task_id,
                url,
                command_line,
                output,
                mime_type,
                logs,
                ..
            } => Ok(DownloadOutcome::Success {
                task_id,
                url,
                command_line,
                output: TaskOutput {
                    bytes: output,
                    mime_type,
                },
                logs,
            }),
            Response::DownloadFailure {
                task_id,
                url,
                command_line,
                logs,
                error,
                ..
            } => Ok(DownloadOutcome::Failure {
                task_id,
                url,
                command_line,
                logs,
                error,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Add a proxy; false when the box already knows its address
    pub async fn add_proxy(&self, proxy: ProxyConfig) -> Result<bool> {
        let response = self
            .call(
                |nonce| Request::AddProxy { nonce, proxy },
                &[ResponseKind::AddedProxy, ResponseKind::NoProxyListener],
                self.request_timeout,
            )
            .await?;

        match response {
            Response::AddedProxy { added, .. } => Ok(added),
            Response::NoProxyListener { .. } => Err(Error::NoProxyListener),
            other => Err(unexpected(other)),
        }
    }

    /// Remove a proxy by address
    pub async fn remove_proxy(&self, address: impl Into<String>) -> Result<Option<ProxyConfig>> {
        let address = address.into();
        let response = self
            .call(
                |nonce| Request::RemoveProxy { nonce, address },
                &[ResponseKind::RemovedProxy, ResponseKind::NoProxyListener],
                self.request_timeout,
            )
            .await?;

        match response {
            Response::RemovedProxy { proxy, .. } => Ok(proxy),
            Response::NoProxyListener { .. } => Err(Error::NoProxyListener),
            other => Err(unexpected(other)),
        }
    }

    /// The box's feature set
    pub async fn server_info(&self) -> Result<FeatureSet> {
        let response = self
            .call(
                |nonce| Request::GetServerInfo { nonce },
                &[ResponseKind::ServerInfo],
                self.request_timeout,
            )
            .await?;

        match response {
            Response::ServerInfo { feature_set, .. } => Ok(feature_set),
            other => Err(unexpected(other)),
        }
    }

    /// Snapshot of a remote task
    pub async fn task_info(&self, task_id: &TaskId) -> Result<TaskInfo> {
        let task_id = task_id.clone();
        let response = self
            .call(
                |nonce| Request::GetTaskInfo { nonce, task_id },
                &[ResponseKind::TaskInfo, ResponseKind::NoTaskWithId],
                self.request_timeout,
            )
            .await?;

        match response {
            Response::TaskInfo { task_info, .. } => Ok(task_info),
            Response::NoTaskWithId { task_id, .. } => Err(Error::TaskNotFound(task_id.to_string())),
            other => Err(unexpected(other)),
        }
    }

    /// Log lines of a remote task
    pub async fn task_logs(&self, task_id: &TaskId) -> Result<Vec<String>> {
        let task_id = task_id.clone();
        let response = self
            .call(
                |nonce| Request::GetTaskLogs { nonce, task_id },
                &[ResponseKind::TaskLogs, ResponseKind::NoTaskWithId],
                self.request_timeout,
            )
            .await?;

        match response {
            Response::TaskLogs { lines, .. } => Ok(lines),
            Response::NoTaskWithId { task_id, .. } => Err(Error::TaskNotFound(task_id.to_string())),
            other => Err(unexpected(other)),
        }
    }

    /// Output of a remote task
    pub async fn task_download(&self, task_id: &TaskId) -> Result<TaskOutput> {
        let task_id = task_id.clone();
        let response = self
            .call(
                |nonce| Request::GetTaskDownload { nonce, task_id },
                &[
                    ResponseKind::TaskDownload,
                    ResponseKind::NoTaskWithId,
                    ResponseKind::NoDownloadAvailable,
                ],
                self.download_timeout,
            )
            .await?;

        match response {
            Response::TaskDownload {
                output, mime_type, ..
            } => Ok(TaskOutput {
                bytes: output,
                mime_type,
            }),
            Response::NoTaskWithId { task_id, .. } => Err(Error::TaskNotFound(task_id.to_string())),
            Response::NoDownloadAvailable { task_id, .. } => Err(Error::NoOutput(task_id.to_string())),
            other => Err(unexpected(other)),
        }
    }

    /// Close the connection; pending calls fail with [`Error::SessionClosed`]
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RemoteBox {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn unexpected(response: Response) -> Error {
    Error::Protocol(format!("unexpected response {:?}", response.kind()))
}

async fn read_responses<S>(
    format: WireFormat,
    mut inbound: S,
    pending: PendingTable,
    cancel: CancellationToken,
) where
    S: Stream<Item = Frame> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = inbound.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match format.decode::<Response>(&frame) {
            Ok(Some(response)) => resolve(&pending, response),
            Ok(None) => debug!("Ignoring frame of the wrong kind"),
            Err(e) => warn!(error = %e, "Undecodable response"),
        }
    }

    cancel.cancel();
    // Dropping the senders fails every pending call
    lock(&pending).clear();
}

fn resolve(pending: &PendingTable, response: Response) {
    let nonce = response.nonce();
    let kind = response.kind();
    let mut table = lock(pending);

    let Some(entries) = table.get_mut(&nonce) else {
        if kind == ResponseKind::Error {
            warn!(nonce, response = ?response, "Remote error for no pending call");
        } else {
            debug!(nonce, kind = ?kind, "No pending call for response");
        }
        return;
    };

    let Some(index) = entries
        .iter()
        .position(|entry| kind == ResponseKind::Error || entry.accepts.contains(&kind))
    else {
        debug!(nonce, kind = ?kind, "Skipping response not awaited by any call");
        return;
    };

    let entry = entries.remove(index);
    if entries.is_empty() {
        table.remove(&nonce);
    }
    drop(table);

    if entry.respond_to.send(response).is_err() {
        debug!(nonce, "Caller gave up before the response arrived");
    }
}

async fn write_frames<K>(mut frames: mpsc::Receiver<Frame>, mut sink: K, cancel: CancellationToken)
where
    K: Sink<Frame> + Unpin,
    K::Error: Display,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "Failed to send request, closing connection");
            break;
        }
    }

    cancel.cancel();
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Failed to close connection");
    }
}
