//! Session tests over in-memory channel transports

use super::*;
use crate::config::{ClientConfig, Config, StorageConfig, ToolConfig};
use crate::error::Error;
use crate::proxy::ProxyPool;
use crate::tasks::{Egress, TaskManager};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(10);

/// Writes `video` to the `-o` template with `mp4` as extension
const WRITE_OUTPUT: &str = r#"
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
echo "[download] done"
printf 'video' > "$(printf '%s' "$out" | sed 's/%(ext)s$/mp4/')"
"#;

fn manager(dir: &Path, script: &str, egress: Egress) -> TaskManager {
    let mut config = Config::default();
    config.tool = ToolConfig {
        program: "/bin/sh".into(),
        default_args: vec!["-c".into(), script.into(), "fake-tool".into()],
    };
    config.storage = StorageConfig {
        logs_dir: dir.join("logs"),
        holding_dir: dir.join("holding"),
        clean_on_shutdown: true,
    };
    TaskManager::new(&config, egress)
}

/// Raw client end of a session: frames to send and frames received
struct Peer {
    to_server: mpsc::Sender<Frame>,
    from_server: mpsc::Receiver<Frame>,
    session: JoinHandle<()>,
}

fn open_session(tasks: TaskManager, format: WireFormat) -> Peer {
    let (to_server, server_in) = mpsc::channel(16);
    let (server_out, from_server) = mpsc::channel(16);
    let session = tokio::spawn(ServerSession::run(tasks, format, server_in, server_out));
    Peer {
        to_server,
        from_server,
        session,
    }
}

impl Peer {
    async fn send(&mut self, format: WireFormat, request: &Request) {
        self.to_server
            .send(format.encode(request).unwrap())
            .await
            .unwrap();
    }

    async fn receive(&mut self, format: WireFormat) -> Response {
        let frame = tokio::time::timeout(WAIT, self.from_server.next())
            .await
            .expect("response in time")
            .expect("session still open");
        format.decode(&frame).unwrap().expect("frame of the negotiated kind")
    }
}

fn remote(tasks: TaskManager, format: WireFormat) -> RemoteBox {
    let (client_out, server_in) = mpsc::channel(16);
    let (server_out, client_in) = mpsc::channel(16);
    tokio::spawn(ServerSession::run(tasks, format, server_in, server_out));
    RemoteBox::new(
        ClientConfig {
            format,
            ..ClientConfig::default()
        },
        client_in,
        client_out,
    )
}

fn request(url: &str) -> DownloadRequest {
    DownloadRequest::new(url).with_args(["-f", "best"])
}

#[cfg(unix)]
#[tokio::test]
async fn responses_are_correlated_by_nonce_not_order() {
    let dir = tempfile::tempdir().unwrap();
    let script = format!("sleep 1\n{WRITE_OUTPUT}");
    let mut peer = open_session(manager(dir.path(), &script, Egress::default()), WireFormat::Json);

    peer.send(
        WireFormat::Json,
        &Request::Download {
            nonce: 10,
            request: request("https://example.com/a"),
            listen_for: ListenCondition::ListenNoData,
        },
    )
    .await;
    peer.send(WireFormat::Json, &Request::GetServerInfo { nonce: 11 }).await;

    let first = peer.receive(WireFormat::Json).await;
    assert!(matches!(first, Response::Downloading { nonce: 10, created: true, .. }));
    let second = peer.receive(WireFormat::Json).await;
    assert!(matches!(second, Response::ServerInfo { nonce: 11, .. }));

    match peer.receive(WireFormat::Json).await {
        Response::DownloadSuccess {
            nonce,
            output,
            mime_type,
            logs,
            ..
        } => {
            assert_eq!(nonce, 10);
            assert!(output.is_empty(), "listening without data");
            assert_eq!(mime_type.as_deref(), Some("video/mp4"));
            assert_eq!(logs, vec!["[download] done"]);
        }
        other => panic!("expected download success, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_and_foreign_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = open_session(manager(dir.path(), "exit 0", Egress::default()), WireFormat::Json);

    peer.to_server
        .send(Frame::Text("{\"bogus\": 1}".into()))
        .await
        .unwrap();
    match peer.receive(WireFormat::Json).await {
        Response::Error { nonce, message } => {
            assert_eq!(nonce, 0);
            assert!(!message.is_empty());
        }
        other => panic!("expected error response, got {other:?}"),
    }

    // Binary frames are not part of a JSON session and get no answer
    peer.to_server.send(Frame::Binary(vec![1, 2, 3])).await.unwrap();
    peer.send(WireFormat::Json, &Request::GetServerInfo { nonce: 5 }).await;
    assert!(matches!(
        peer.receive(WireFormat::Json).await,
        Response::ServerInfo { nonce: 5, .. }
    ));
}

#[tokio::test]
async fn lookups_of_unknown_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = open_session(manager(dir.path(), "exit 0", Egress::default()), WireFormat::Bincode);
    let task_id = TaskId::from("missing");

    for (nonce, request) in [
        (1, Request::GetTaskInfo { nonce: 1, task_id: task_id.clone() }),
        (2, Request::GetTaskLogs { nonce: 2, task_id: task_id.clone() }),
        (3, Request::GetTaskDownload { nonce: 3, task_id: task_id.clone() }),
    ] {
        peer.send(WireFormat::Bincode, &request).await;
        assert_eq!(
            peer.receive(WireFormat::Bincode).await,
            Response::NoTaskWithId {
                nonce,
                task_id: task_id.clone()
            }
        );
    }
}

#[tokio::test]
async fn proxy_requests_without_pool() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = open_session(manager(dir.path(), "exit 0", Egress::default()), WireFormat::Json);

    peer.send(
        WireFormat::Json,
        &Request::AddProxy {
            nonce: 4,
            proxy: ProxyConfig::new("http://p:1", 1),
        },
    )
    .await;
    assert_eq!(
        peer.receive(WireFormat::Json).await,
        Response::NoProxyListener { nonce: 4 }
    );
}

#[tokio::test]
async fn session_ends_with_its_inbound_stream() {
    let dir = tempfile::tempdir().unwrap();
    let Peer {
        to_server,
        mut from_server,
        session,
    } = open_session(manager(dir.path(), "exit 0", Egress::default()), WireFormat::Json);

    drop(to_server);
    tokio::time::timeout(WAIT, session)
        .await
        .expect("session ended")
        .unwrap();
    assert!(from_server.next().await.is_none(), "outbound side is closed");
}

#[tokio::test]
async fn remote_box_manages_proxies() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ProxyPool::in_memory(Vec::new());
    let egress = Egress {
        proxies: Some(pool.clone()),
        rotator: None,
    };
    let remote = remote(manager(dir.path(), "exit 0", egress), WireFormat::Bincode);

    assert!(remote.add_proxy(ProxyConfig::new("http://p:1", 2)).await.unwrap());
    assert!(!remote.add_proxy(ProxyConfig::new("http://p:1", 5)).await.unwrap());
    assert_eq!(pool.list().await.unwrap().len(), 1);

    let info = remote.server_info().await.unwrap();
    assert!(info.listening_for_proxy);

    let removed = remote.remove_proxy("http://p:1").await.unwrap();
    assert_eq!(removed, Some(ProxyConfig::new("http://p:1", 2)));
    assert_eq!(remote.remove_proxy("http://p:1").await.unwrap(), None);
}

#[tokio::test]
async fn remote_box_maps_negative_answers_to_errors() {
    let dir = tempfile::tempdir().unwrap();
    let remote = remote(manager(dir.path(), "exit 0", Egress::default()), WireFormat::Json);
    let missing = TaskId::from("missing");

    assert!(matches!(remote.task_info(&missing).await, Err(Error::TaskNotFound(_))));
    assert!(matches!(remote.task_logs(&missing).await, Err(Error::TaskNotFound(_))));
    assert!(matches!(remote.task_download(&missing).await, Err(Error::TaskNotFound(_))));
    assert!(matches!(
        remote.add_proxy(ProxyConfig::new("http://p:1", 1)).await,
        Err(Error::NoProxyListener)
    ));
    assert!(matches!(
        remote.begin_download(DownloadRequest::new("not a url")).await,
        Err(Error::Protocol(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn end_to_end_download_over_bincode() {
    let dir = tempfile::tempdir().unwrap();
    let remote = remote(
        manager(dir.path(), WRITE_OUTPUT, Egress::default()),
        WireFormat::Bincode,
    );

    let outcome = remote
        .download_with_data(request("https://example.com/a"))
        .await
        .unwrap();
    let task_id = match outcome {
        DownloadOutcome::Success {
            task_id,
            url,
            output,
            logs,
            ..
        } => {
            assert_eq!(url, "https://example.com/a");
            assert_eq!(output.bytes, b"video");
            assert_eq!(output.mime_type.as_deref(), Some("video/mp4"));
            assert_eq!(logs, vec!["[download] done"]);
            task_id
        }
        other => panic!("expected success, got {other:?}"),
    };

    let again = remote.begin_download(request("https://example.com/a")).await.unwrap();
    assert_eq!(again.id, task_id);
    assert!(!again.created);

    let cached = remote
        .download_without_data(request("https://example.com/a"))
        .await
        .unwrap();
    assert!(matches!(
        cached,
        DownloadOutcome::Success { ref output, .. } if output.bytes.is_empty()
    ));

    assert!(matches!(
        remote.task_info(&task_id).await.unwrap(),
        TaskInfo::Successful { .. }
    ));
    assert_eq!(remote.task_download(&task_id).await.unwrap().bytes, b"video");
    assert_eq!(remote.task_logs(&task_id).await.unwrap(), vec!["[download] done"]);
}

#[cfg(unix)]
#[tokio::test]
async fn end_to_end_failure_over_json() {
    let dir = tempfile::tempdir().unwrap();
    let remote = remote(
        manager(dir.path(), "echo 'ERROR: Video unavailable'\nexit 1", Egress::default()),
        WireFormat::Json,
    );

    match remote.download_with_data(request("https://example.com/a")).await.unwrap() {
        DownloadOutcome::Failure { error, logs, .. } => {
            assert_eq!(error, Some(crate::error::TaskError::VideoNotAvailable));
            assert_eq!(logs, vec!["ERROR: Video unavailable"]);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn silent_server_times_out() {
    let (client_out, _server_in) = mpsc::channel(16);
    let (_server_out, client_in) = mpsc::channel::<Frame>(16);
    let remote = RemoteBox::new(
        ClientConfig {
            request_timeout: Duration::from_millis(100),
            ..ClientConfig::default()
        },
        client_in,
        client_out,
    );

    match remote.server_info().await {
        Err(Error::Timeout { after, .. }) => assert_eq!(after, Duration::from_millis(100)),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn closed_connection_fails_calls() {
    let (client_out, _server_in) = mpsc::channel(16);
    let (server_out, client_in) = mpsc::channel::<Frame>(16);
    let remote = RemoteBox::new(ClientConfig::default(), client_in, client_out);

    drop(server_out);
    tokio::time::timeout(WAIT, async {
        while remote.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reader noticed the closed stream");

    assert!(matches!(remote.server_info().await, Err(Error::SessionClosed)));
}

#[tokio::test]
async fn out_of_order_responses_reach_their_callers() {
    let (client_out, mut peer_in) = mpsc::channel::<Frame>(16);
    let (mut peer_out, client_in) = mpsc::channel::<Frame>(16);
    let remote = RemoteBox::new(ClientConfig::default(), client_in, client_out);

    let peer = tokio::spawn(async move {
        let mut requests = Vec::new();
        while requests.len() < 2 {
            let frame = peer_in.next().await.expect("request frame");
            let request: Request = WireFormat::Json
                .decode(&frame)
                .expect("decodes")
                .expect("request");
            requests.push(request);
        }

        for request in requests.into_iter().rev() {
            let response = match request {
                Request::GetTaskLogs { nonce, task_id } => Response::TaskLogs {
                    nonce,
                    task_id,
                    lines: vec!["[download] 100%".to_string()],
                },
                Request::GetServerInfo { nonce } => Response::ServerInfo {
                    nonce,
                    feature_set: FeatureSet {
                        tool_program: "fake-dl".to_string(),
                        default_args: Vec::new(),
                        rotating_addresses: false,
                        listening_for_proxy: true,
                        completion_actions: Vec::new(),
                    },
                },
                other => panic!("unexpected request {other:?}"),
            };
            let frame = WireFormat::Json.encode(&response).expect("encodes");
            peer_out.send(frame).await.expect("send response");
        }
        peer_out
    });

    let task_id = TaskId::from("t-1");
    let (logs, info) = tokio::time::timeout(WAIT, async {
        tokio::join!(remote.task_logs(&task_id), remote.server_info())
    })
    .await
    .expect("both calls resolve");

    assert_eq!(logs.expect("logs"), vec!["[download] 100%".to_string()]);
    let info = info.expect("server info");
    assert_eq!(info.tool_program, "fake-dl");
    assert!(info.listening_for_proxy);

    let _peer_out = peer.await.expect("peer finished");
}

#[test]
fn nonces_are_echoed_by_every_variant() {
    let request = Request::GetTaskLogs {
        nonce: 42,
        task_id: TaskId::from("t"),
    };
    assert_eq!(request.nonce(), 42);

    let response = Response::NoDownloadAvailable {
        nonce: 42,
        task_id: TaskId::from("t"),
    };
    assert_eq!(response.nonce(), 42);
    assert_eq!(response.kind(), ResponseKind::NoDownloadAvailable);
}
