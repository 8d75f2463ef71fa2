//! Task manager tests driven by a shell script standing in for the download tool
//!
//! The tool is `/bin/sh -c SCRIPT fake-tool`, so the script sees the caller
//! arguments, egress arguments, `-o TEMPLATE` and the URL as `$1..$N`.

#![cfg(unix)]

use super::*;
use crate::config::{Config, StorageConfig, ToolConfig};
use crate::error::TaskError;
use crate::proxy::ProxyPool;
use crate::rotator::AddressRotator;
use crate::types::{CompletionRequest, ProxyConfig};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Find `-o TEMPLATE` and write `video` to the template with `mp4` as extension
const WRITE_OUTPUT: &str = r#"
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
echo "[download] writing output"
printf 'video' > "$(printf '%s' "$out" | sed 's/%(ext)s$/mp4/')"
"#;

const WAIT: Duration = Duration::from_secs(10);

fn config(dir: &Path, script: String) -> Config {
    let mut config = Config::default();
    config.tool = ToolConfig {
        program: "/bin/sh".into(),
        default_args: vec!["-c".into(), script, "fake-tool".into()],
    };
    config.storage = StorageConfig {
        logs_dir: dir.join("logs"),
        holding_dir: dir.join("holding"),
        clean_on_shutdown: true,
    };
    config.tasks.retry.initial_delay = Duration::ZERO;
    config.tasks.completion_grace = Duration::from_secs(60);
    config.tasks.shutdown_grace = Duration::from_secs(60);
    config
}

/// Script that counts its runs in `counter`, then runs `body`
fn counting(counter: &Path, body: &str) -> String {
    format!("echo run >> '{}'\n{}", counter.display(), body)
}

fn runs(counter: &Path) -> usize {
    std::fs::read_to_string(counter)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn request(url: &str) -> DownloadRequest {
    DownloadRequest::new(url).with_args(["-f", "best"])
}

async fn outcome_of(submission: Submission) -> TaskOutcome {
    let listener = submission.listener.expect("listener requested");
    tokio::time::timeout(WAIT, listener)
        .await
        .expect("task finished in time")
        .expect("listener fired")
}

#[tokio::test]
async fn successful_download_is_readable() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(&config(dir.path(), WRITE_OUTPUT.to_string()), Egress::default());

    let submission = manager
        .request_download(request("https://example.com/a"), ListenCondition::ListenWithData)
        .await
        .unwrap();
    assert!(submission.created);
    let id = submission.task.id().clone();

    let outcome = outcome_of(submission).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.error, None);
    assert!(outcome.output_file.as_ref().unwrap().ends_with(format!("{id}.mp4")));
    assert_eq!(outcome.command_line[0], "/bin/sh");
    assert_eq!(outcome.command_line.last().unwrap(), "https://example.com/a");

    match manager.task_info(&id).await.unwrap() {
        TaskInfo::Successful {
            summary,
            data_location,
        } => {
            assert_eq!(data_location, format!("/{id}/download"));
            assert_eq!(summary.logs_location, format!("/{id}/logs"));
            assert_eq!(summary.status, TaskStatus::CompleteSuccess);
            assert_eq!(summary.args, vec!["-f", "best"]);
            assert_eq!(summary.log_tail.as_deref(), Some("[download] writing output"));
        }
        other => panic!("expected successful task info, got {other:?}"),
    }

    let output = manager.task_output(&id).await.unwrap();
    assert_eq!(output.bytes, b"video");
    assert_eq!(output.mime_type.as_deref(), Some("video/mp4"));

    let logs = manager.task_logs(&id).await.unwrap();
    assert_eq!(logs, vec!["[download] writing output"]);
}

#[tokio::test]
async fn identical_requests_share_one_task() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("runs");
    let script = counting(&counter, &format!("sleep 1\n{WRITE_OUTPUT}"));
    let manager = TaskManager::new(&config(dir.path(), script), Egress::default());

    let (first, second) = tokio::join!(
        manager.request_download(request("https://example.com/a"), ListenCondition::ListenNoData),
        manager.request_download(request("https://example.com/a"), ListenCondition::ListenNoData),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.task.id(), second.task.id());
    assert!(first.created ^ second.created, "exactly one request creates the task");
    assert_eq!(manager.len().await, 1);

    let (a, b) = tokio::join!(outcome_of(first), outcome_of(second));
    assert!(a.is_success());
    assert_eq!(a, b);
    assert_eq!(runs(&counter), 1);

    let other_args = manager
        .request_download(DownloadRequest::new("https://example.com/a"), ListenCondition::DoNotListen)
        .await
        .unwrap();
    assert!(other_args.created, "different args make a different key");
    assert_eq!(manager.len().await, 2);
}

#[tokio::test]
async fn argument_boundaries_separate_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(&config(dir.path(), "sleep 5".to_string()), Egress::default());
    let url = "https://example.com/a";

    let joined = manager
        .request_download(
            DownloadRequest::new(url).with_args(["--match-filter", "a, b"]),
            ListenCondition::DoNotListen,
        )
        .await
        .unwrap();
    let split = manager
        .request_download(
            DownloadRequest::new(url).with_args(["--match-filter", "a", "b"]),
            ListenCondition::DoNotListen,
        )
        .await
        .unwrap();

    assert!(joined.created && split.created);
    assert_ne!(joined.task.id(), split.task.id());
    assert_eq!(manager.len().await, 2);
}

#[tokio::test]
async fn finished_task_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("runs");
    let manager = TaskManager::new(
        &config(dir.path(), counting(&counter, WRITE_OUTPUT)),
        Egress::default(),
    );

    let first = manager
        .request_download(request("https://example.com/a"), ListenCondition::ListenWithData)
        .await
        .unwrap();
    let id = first.task.id().clone();
    outcome_of(first).await;

    let again = manager
        .request_download(request("https://example.com/a"), ListenCondition::ListenWithData)
        .await
        .unwrap();
    assert!(!again.created);
    assert_eq!(again.task.id(), &id);

    let outcome = outcome_of(again).await;
    assert!(outcome.is_success());
    assert_eq!(runs(&counter), 1, "the tool is not run again");
}

#[tokio::test]
async fn retryable_failures_use_the_whole_budget() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("runs");
    let manager = TaskManager::new(
        &config(dir.path(), counting(&counter, "echo 'ERROR: something broke'\nexit 1")),
        Egress::default(),
    );

    let submission = manager
        .request_download(request("https://example.com/a"), ListenCondition::ListenNoData)
        .await
        .unwrap();
    let id = submission.task.id().clone();
    let outcome = outcome_of(submission).await;

    assert_eq!(outcome.status, TaskStatus::CompleteFailure);
    assert_eq!(outcome.error, Some(TaskError::Unknown));
    assert_eq!(outcome.output_file, None);
    assert_eq!(runs(&counter), 5);

    match manager.task_info(&id).await.unwrap() {
        TaskInfo::Generic { summary } => {
            assert_eq!(summary.status, TaskStatus::CompleteFailure);
            assert_eq!(summary.error, Some(TaskError::Unknown));
        }
        other => panic!("expected generic task info, got {other:?}"),
    }
    assert!(matches!(
        manager.task_output(&id).await,
        Err(Error::NoOutput(_))
    ));
}

#[tokio::test]
async fn unavailable_video_stops_after_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("runs");
    let manager = TaskManager::new(
        &config(
            dir.path(),
            counting(&counter, "echo 'ERROR: [youtube] abc: Video unavailable'\nexit 1"),
        ),
        Egress::default(),
    );

    let outcome = outcome_of(
        manager
            .request_download(request("https://example.com/a"), ListenCondition::ListenNoData)
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(outcome.error, Some(TaskError::VideoNotAvailable));
    assert_eq!(runs(&counter), 1);
}

#[tokio::test]
async fn clean_exit_without_output_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(&config(dir.path(), "exit 0".into()), Egress::default());

    let outcome = outcome_of(
        manager
            .request_download(request("https://example.com/a"), ListenCondition::ListenNoData)
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(outcome.status, TaskStatus::CompleteFailure);
    assert_eq!(outcome.error, None);
}

#[tokio::test]
async fn missing_tool_counts_as_failed_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), String::new());
    config.tool = ToolConfig {
        program: dir.path().join("no-such-tool"),
        default_args: vec![],
    };
    config.tasks.retry.max_attempts = 2;
    let manager = TaskManager::new(&config, Egress::default());

    let outcome = outcome_of(
        manager
            .request_download(request("https://example.com/a"), ListenCondition::ListenNoData)
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(outcome.status, TaskStatus::CompleteFailure);
    assert_eq!(outcome.error, Some(TaskError::Unknown));
}

#[tokio::test]
async fn finished_tasks_expire_with_their_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), WRITE_OUTPUT.to_string());
    config.tasks.completion_grace = Duration::from_millis(100);
    config.tasks.shutdown_grace = Duration::from_millis(100);
    let manager = TaskManager::new(&config, Egress::default());

    let submission = manager
        .request_download(request("https://example.com/a"), ListenCondition::ListenNoData)
        .await
        .unwrap();
    let id = submission.task.id().clone();
    let outcome = outcome_of(submission).await;
    let output = outcome.output_file.clone().unwrap();
    assert!(output.exists());
    assert!(outcome.log_file.exists());

    tokio::time::timeout(WAIT, async {
        while manager.get(&id).await.is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("task expired");

    assert!(manager.find_by_key(&request("https://example.com/a").key()).await.is_none());
    assert!(matches!(
        manager.task_info(&id).await,
        Err(Error::TaskNotFound(_))
    ));
    assert!(!output.exists());
    assert!(!outcome.log_file.exists());

    let fresh = manager
        .request_download(request("https://example.com/a"), ListenCondition::DoNotListen)
        .await
        .unwrap();
    assert!(fresh.created);
    assert_ne!(fresh.task.id(), &id);
}

#[tokio::test]
async fn hooks_run_before_listeners() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(
        &config(dir.path(), format!("sleep 1\n{WRITE_OUTPUT}")),
        Egress::default(),
    );

    let submission = manager
        .request_download(request("https://example.com/a"), ListenCondition::ListenNoData)
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (on_success, on_complete) = (calls.clone(), calls.clone());
    assert!(submission.task.on_success(Box::new(move |outcome| {
        assert!(outcome.is_success());
        on_success.fetch_add(1, Ordering::SeqCst);
    })));
    assert!(submission.task.on_complete(Box::new(move |_| {
        on_complete.fetch_add(10, Ordering::SeqCst);
    })));

    let task = submission.task.clone();
    outcome_of(submission).await;
    assert_eq!(calls.load(Ordering::SeqCst), 11);
    assert!(!task.on_complete(Box::new(|_| {})));
}

#[tokio::test]
async fn panicking_hook_does_not_block_listeners() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(
        &config(dir.path(), format!("sleep 1\n{WRITE_OUTPUT}")),
        Egress::default(),
    );

    let submission = manager
        .request_download(request("https://example.com/a"), ListenCondition::ListenNoData)
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let after = calls.clone();
    assert!(submission.task.on_complete(Box::new(|_| panic!("hook failed"))));
    assert!(submission.task.on_complete(Box::new(move |_| {
        after.fetch_add(1, Ordering::SeqCst);
    })));

    let outcome = outcome_of(submission).await;
    assert!(outcome.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1, "later hooks still run");
}

#[tokio::test]
async fn borrowed_proxy_is_passed_and_returned() {
    let dir = tempfile::tempdir().unwrap();
    let args = dir.path().join("args");
    let script = format!("echo \"$@\" > '{}'\n{WRITE_OUTPUT}", args.display());
    let pool = ProxyPool::in_memory(vec![ProxyConfig::new("http://p1:8080", 1)]);
    let manager = TaskManager::new(
        &config(dir.path(), script),
        Egress {
            proxies: Some(pool.clone()),
            rotator: None,
        },
    );

    let outcome = outcome_of(
        manager
            .request_download(request("https://example.com/a"), ListenCondition::ListenNoData)
            .await
            .unwrap(),
    )
    .await;
    assert!(outcome.is_success());

    let recorded = std::fs::read_to_string(&args).unwrap();
    assert!(recorded.starts_with("-f best --proxy http://p1:8080 -o "));

    let entries = pool.snapshot().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].load, 0);
    assert_eq!(entries[0].errors, 0);
}

#[tokio::test]
async fn proxy_blamed_by_the_log_is_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let args = dir.path().join("args");
    let script = format!(
        "echo \"$@\" >> '{}'\necho 'ERROR: An existing connection was forcibly closed by the remote host'\nexit 1",
        args.display()
    );
    let mut proxy = ProxyConfig::new("http://bad:8080", 1);
    proxy.error_limit = 1;
    let pool = ProxyPool::in_memory(vec![proxy]);

    let mut config = config(dir.path(), script);
    config.tasks.retry.max_attempts = 2;
    let manager = TaskManager::new(
        &config,
        Egress {
            proxies: Some(pool.clone()),
            rotator: None,
        },
    );

    let outcome = outcome_of(
        manager
            .request_download(request("https://example.com/a"), ListenCondition::ListenNoData)
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(outcome.error, Some(TaskError::ConnectionForciblyClosed));

    assert!(pool.list().await.unwrap().is_empty());
    let recorded = std::fs::read_to_string(&args).unwrap();
    let attempts: Vec<&str> = recorded.lines().collect();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].contains("--proxy http://bad:8080"));
    assert!(!attempts[1].contains("--proxy"), "evicted proxy is not reused");
}

#[tokio::test]
async fn rotator_supplies_source_address() {
    let dir = tempfile::tempdir().unwrap();
    let args = dir.path().join("args");
    let script = format!("echo \"$@\" > '{}'\n{WRITE_OUTPUT}", args.display());
    let rotator = Arc::new(AddressRotator::spawn(vec!["192.0.2.0/30".parse().unwrap()]));
    let manager = TaskManager::new(
        &config(dir.path(), script),
        Egress {
            proxies: None,
            rotator: Some(rotator),
        },
    );
    assert!(manager.features().rotating_addresses);
    assert!(!manager.features().listening_for_proxy);

    outcome_of(
        manager
            .request_download(request("https://example.com/a"), ListenCondition::ListenNoData)
            .await
            .unwrap(),
    )
    .await;

    let recorded = std::fs::read_to_string(&args).unwrap();
    assert!(recorded.starts_with("-f best --force-ipv4 --source-address 192.0.2.0 -o "));
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(&config(dir.path(), "exit 0".into()), Egress::default());
    let id = TaskId::from("missing");

    assert!(manager.is_empty().await);
    assert!(matches!(manager.task_info(&id).await, Err(Error::TaskNotFound(_))));
    assert!(matches!(manager.task_logs(&id).await, Err(Error::TaskNotFound(_))));
    assert!(matches!(manager.task_output(&id).await, Err(Error::TaskNotFound(_))));
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(&config(dir.path(), "exit 0".into()), Egress::default());

    let err = manager
        .request_download(DownloadRequest::new("not a url"), ListenCondition::DoNotListen)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn unconfigured_completion_actions_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(&config(dir.path(), "sleep 1".into()), Egress::default());

    let mut request = request("https://example.com/a");
    request.completion_actions = vec![CompletionRequest::Rclone {
        path: "shows/a.mp4".into(),
    }];
    let submission = manager
        .request_download(request, ListenCondition::DoNotListen)
        .await
        .unwrap();

    assert!(submission.task.actions().is_empty());
    assert!(submission.listener.is_none());
    assert!(manager.features().completion_actions.is_empty());
}
