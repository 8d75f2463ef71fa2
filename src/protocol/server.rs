//! Server side of a protocol connection
//!
//! A session runs two flows over one connection. The inbound flow decodes
//! frames and dispatches requests; the outbound flow drains a bounded queue of
//! responses and writes them in enqueue order. Listening downloads spawn a wait
//! per request that enqueues the completion response once the task finishes.
//! Everything the session spawned is bound to its cancellation token; the
//! tasks themselves keep running after the session ends.

use super::{Frame, Nonce, Request, Response, WireFormat};
use crate::error::Error;
use crate::tasks::{TaskManager, TaskOutcome};
use crate::types::{ListenCondition, TaskId};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Responses waiting to be written before the inbound flow is slowed down
const OUTBOUND_CAPACITY: usize = 16;

/// One accepted protocol connection
pub struct ServerSession {
    tasks: TaskManager,
    outbound: mpsc::Sender<Response>,
    cancel: CancellationToken,
}

impl ServerSession {
    /// Serve a connection until its inbound stream ends
    pub async fn run<S, K>(tasks: TaskManager, format: WireFormat, mut inbound: S, outbound: K)
    where
        S: Stream<Item = Frame> + Unpin,
        K: Sink<Frame> + Unpin + Send + 'static,
        K::Error: Display,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(write_responses(format, rx, outbound, cancel.clone()));
        let session = ServerSession {
            tasks,
            outbound: tx,
            cancel: cancel.clone(),
        };
        info!(format = ?format, "Protocol session opened");

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = inbound.next() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match format.decode::<Request>(&frame) {
                Ok(Some(request)) => session.receive_request(request).await,
                Ok(None) => debug!("Ignoring frame of the wrong kind"),
                Err(e) => {
                    warn!(error = %e, "Undecodable request");
                    session
                        .enqueue(Response::Error {
                            nonce: 0,
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }

        cancel.cancel();
        drop(session);
        if let Err(e) = writer.await {
            warn!(error = %e, "Response writer aborted");
        }
        info!("Protocol session closed");
    }

    /// Dispatch one request, enqueueing its immediate response
    pub async fn receive_request(&self, request: Request) {
        let nonce = request.nonce();
        debug!(nonce, request = ?request, "Request received");

        let response = match request {
            Request::Download {
                nonce,
                request,
                listen_for,
            } => match self.tasks.request_download(request, listen_for).await {
                Ok(submission) => {
                    let task = &submission.task;
                    self.enqueue(Response::Downloading {
                        nonce,
                        task_id: task.id().clone(),
                        created: submission.created,
                        url: task.url().to_string(),
                        args: task.args().to_vec(),
                    })
                    .await;
                    if let Some(listener) = submission.listener {
                        self.spawn_listener(nonce, listen_for, listener);
                    }
                    return;
                }
                Err(e) => error_response(nonce, &e),
            },
            Request::AddProxy { nonce, proxy } => match self.tasks.proxies() {
                None => Response::NoProxyListener { nonce },
                Some(pool) => match pool.add(proxy.clone()).await {
                    Ok(added) => Response::AddedProxy {
                        nonce,
                        proxy,
                        added,
                    },
                    Err(e) => error_response(nonce, &e),
                },
            },
            Request::RemoveProxy { nonce, address } => match self.tasks.proxies() {
                None => Response::NoProxyListener { nonce },
                Some(pool) => match pool.remove(address).await {
                    Ok(proxy) => Response::RemovedProxy { nonce, proxy },
                    Err(e) => error_response(nonce, &e),
                },
            },
            Request::GetServerInfo { nonce } => Response::ServerInfo {
                nonce,
                feature_set: self.tasks.features(),
            },
            Request::GetTaskInfo { nonce, task_id } => match self.tasks.task_info(&task_id).await {
                Ok(task_info) => Response::TaskInfo { nonce, task_info },
                Err(e) => lookup_failure(nonce, task_id, &e),
            },
            Request::GetTaskLogs { nonce, task_id } => match self.tasks.task_logs(&task_id).await {
                Ok(lines) => Response::TaskLogs {
                    nonce,
                    task_id,
                    lines,
                },
                Err(e) => lookup_failure(nonce, task_id, &e),
            },
            Request::GetTaskDownload { nonce, task_id } => {
                match self.tasks.task_output(&task_id).await {
                    Ok(output) => Response::TaskDownload {
                        nonce,
                        task_id,
                        output: output.bytes,
                        mime_type: output.mime_type,
                    },
                    Err(e) => lookup_failure(nonce, task_id, &e),
                }
            }
        };

        self.enqueue(response).await;
    }

    async fn enqueue(&self, response: Response) {
        let nonce = response.nonce();
        if self.outbound.send(response).await.is_err() {
            debug!(nonce, "Session closed before the response was queued");
        }
    }

    fn spawn_listener(
        &self,
        nonce: Nonce,
        listen: ListenCondition,
        listener: oneshot::Receiver<TaskOutcome>,
    ) {
        let tasks = self.tasks.clone();
        let outbound = self.outbound.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = listener => outcome,
            };
            let Ok(outcome) = outcome else {
                debug!(nonce, "Task dropped its listener");
                return;
            };
            let response = completion_response(&tasks, nonce, listen, outcome).await;
            tokio::select! {
                _ = cancel.cancelled() => {}
                sent = outbound.send(response) => {
                    if sent.is_err() {
                        debug!(nonce, "Session closed before the outcome was queued");
                    }
                }
            }
        });
    }
}

async fn completion_response(
    tasks: &TaskManager,
    nonce: Nonce,
    listen: ListenCondition,
    outcome: TaskOutcome,
) -> Response {
    let logs = tasks.task_logs(&outcome.task_id).await.unwrap_or_default();

    if !outcome.is_success() {
        return Response::DownloadFailure {
            nonce,
            task_id: outcome.task_id,
            url: outcome.url,
            command_line: outcome.command_line,
            logs,
            error: outcome.error,
        };
    }

    let (output, mime_type) = match listen {
        ListenCondition::ListenWithData => match tasks.task_output(&outcome.task_id).await {
            Ok(output) => (output.bytes, output.mime_type),
            Err(e) => return error_response(nonce, &e),
        },
        _ => (
            Vec::new(),
            outcome
                .output_file
                .as_deref()
                .and_then(|path| mime_guess::from_path(path).first())
                .map(|mime| mime.to_string()),
        ),
    };

    Response::DownloadSuccess {
        nonce,
        task_id: outcome.task_id,
        url: outcome.url,
        command_line: outcome.command_line,
        output,
        mime_type,
        logs,
    }
}

fn lookup_failure(nonce: Nonce, task_id: TaskId, error: &Error) -> Response {
    match error {
        Error::TaskNotFound(_) => Response::NoTaskWithId { nonce, task_id },
        Error::NoOutput(_) => Response::NoDownloadAvailable { nonce, task_id },
        other => error_response(nonce, other),
    }
}

fn error_response(nonce: Nonce, error: &Error) -> Response {
    Response::Error {
        nonce,
        message: error.to_string(),
    }
}

async fn write_responses<K>(
    format: WireFormat,
    mut responses: mpsc::Receiver<Response>,
    mut sink: K,
    cancel: CancellationToken,
) where
    K: Sink<Frame> + Unpin,
    K::Error: Display,
{
    loop {
        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            response = responses.recv() => match response {
                Some(response) => response,
                None => break,
            },
        };

        let nonce = response.nonce();
        let frame = match format.encode(&response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(nonce, error = %e, "Failed to encode response");
                continue;
            }
        };
        if let Err(e) = sink.send(frame).await {
            warn!(nonce, error = %e, "Failed to send response, closing session");
            cancel.cancel();
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Failed to close connection");
    }
}
