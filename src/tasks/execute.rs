//! Per-task execution: attempt loop, outcome, hooks, expiry

use super::files;
use super::task::{Task, TaskHook, TaskOutcome};
use super::TaskEnv;
use crate::actions::{self, CompletionContext};
use crate::classify::read_log;
use crate::config::ToolConfig;
use crate::error::{Error, TaskError};
use crate::retry;
use crate::rotator::source_address_args;
use crate::types::{DownloadRequest, ProcessInfo, ProxyConfig, TaskId, TaskStatus};
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Run `task` to completion on its own tokio task, then expire it
///
/// Expiry runs even if execution panicked. In that case the task is recorded
/// as a failure, unless an outcome already exists, and its listeners are
/// notified either way.
pub(super) fn spawn(env: Arc<TaskEnv>, task: Arc<Task>) {
    tokio::spawn(async move {
        let run = tokio::spawn(execute(env.clone(), task.clone()));
        if let Err(e) = run.await {
            error!(task_id = %task.id(), error = %e, "Task execution aborted");
            let log_file = files::log_path(&env.storage, task.id());
            let outcome = TaskOutcome {
                task_id: task.id().clone(),
                url: task.url().to_string(),
                command_line: task.command_line(),
                status: TaskStatus::CompleteFailure,
                error: Some(task.error().unwrap_or(TaskError::Unknown)),
                log_file,
                output_file: None,
            };
            task.finish(outcome);
            task.notify_listeners();
        }
        expire(&env, &task).await;
    });
}

async fn execute(env: Arc<TaskEnv>, task: Arc<Task>) {
    task.advance(TaskStatus::Initialising);

    let log_file = files::log_path(&env.storage, task.id());
    let template = files::output_template(&env.storage, task.id());
    for dir in [&env.storage.logs_dir, &env.storage.holding_dir] {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to create task directory");
        }
    }

    let start = Instant::now();
    let result = retry::download_with_retry(&env.tasks.retry, |attempt| {
        run_attempt(&env, &task, attempt, &log_file, &template)
    })
    .await;

    let error = result.err();
    let output_file = files::find_output(&env.storage.holding_dir, task.id()).await;
    let status = if error.is_none() && output_file.is_some() {
        TaskStatus::CompleteSuccess
    } else {
        TaskStatus::CompleteFailure
    };
    info!(
        task_id = %task.id(),
        url = %task.url(),
        status = %status,
        error = ?error,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Download finished"
    );

    let outcome = TaskOutcome {
        task_id: task.id().clone(),
        url: task.url().to_string(),
        command_line: task.command_line(),
        status,
        error,
        log_file: log_file.clone(),
        output_file: if status == TaskStatus::CompleteSuccess {
            output_file.clone()
        } else {
            None
        },
    };

    let Some(finished) = task.finish(outcome.clone()) else {
        return;
    };

    if outcome.is_success() {
        for hook in finished.success_hooks {
            run_hook(task.id(), hook, &outcome);
        }
    }
    for hook in finished.completion_hooks {
        run_hook(task.id(), hook, &outcome);
    }
    actions::spawn_all(
        finished.actions,
        CompletionContext {
            task_id: task.id().clone(),
            url: task.url().to_string(),
            log_file,
            output_file,
            error,
        },
    );

    let notified = task.notify_listeners();
    debug!(task_id = %task.id(), listeners = notified, "Listeners notified");
}

/// Run one hook; a panicking hook is logged and does not stop the others
fn run_hook(task_id: &TaskId, hook: TaskHook, outcome: &TaskOutcome) {
    if panic::catch_unwind(AssertUnwindSafe(|| hook(outcome))).is_err() {
        error!(task_id = %task_id, "Task hook panicked");
    }
}

/// One execution of the tool: pick an egress identity, run, classify, return the proxy
async fn run_attempt(
    env: &TaskEnv,
    task: &Task,
    attempt: u32,
    log_file: &Path,
    template: &str,
) -> Result<(), TaskError> {
    let proxy = match &env.egress.proxies {
        Some(pool) => pool.borrow().await.unwrap_or_else(|e| {
            warn!(task_id = %task.id(), error = %e, "Proxy pool unavailable");
            None
        }),
        None => None,
    };
    let source = match (&proxy, &env.egress.rotator) {
        (None, Some(rotator)) => rotator.next().await,
        _ => None,
    };

    let command_line = build_command_line(
        &env.tool,
        &task_request(task),
        proxy.as_ref(),
        source,
        template,
    );
    debug!(task_id = %task.id(), attempt, command = ?command_line, "Starting attempt");
    task.begin_attempt(command_line.clone());

    let result = match run_process(task, &command_line, log_file).await {
        Ok(status) if exit_succeeded(&status) => Ok(()),
        Ok(status) => {
            let log = read_log(log_file).await;
            let error = env.classifier.classify(&log);
            debug!(task_id = %task.id(), attempt, code = ?status.code(), error = %error, "Attempt failed");
            Err(error)
        }
        Err(e) => {
            warn!(task_id = %task.id(), attempt, error = %e, "Attempt could not run");
            Err(TaskError::Unknown)
        }
    };
    task.process_exited(result.err());

    if let (Some(proxy), Some(pool)) = (proxy, &env.egress.proxies) {
        let log = read_log(log_file).await;
        let blamed = env.classifier.blames_proxy(&log);
        if blamed {
            warn!(task_id = %task.id(), proxy = %proxy.address, "Attempt blamed on proxy");
        }
        if let Err(e) = pool.give_back(&proxy, blamed).await {
            warn!(task_id = %task.id(), error = %e, "Failed to return proxy");
        }
    }

    result
}

fn task_request(task: &Task) -> DownloadRequest {
    DownloadRequest::new(task.url()).with_args(task.args().iter().cloned())
}

/// Tool, default args, caller args, egress args, `-o TEMPLATE`, URL
pub(crate) fn build_command_line(
    tool: &ToolConfig,
    request: &DownloadRequest,
    proxy: Option<&ProxyConfig>,
    source: Option<IpAddr>,
    template: &str,
) -> Vec<String> {
    let mut command = Vec::with_capacity(tool.default_args.len() + request.args.len() + 8);
    command.push(tool.program.display().to_string());
    command.extend(tool.default_args.iter().cloned());
    command.extend(request.args.iter().cloned());

    if let Some(proxy) = proxy {
        command.push("--proxy".to_string());
        command.push(proxy.address.clone());
    } else if let Some(addr) = source {
        command.extend(source_address_args(addr));
    }

    command.push("-o".to_string());
    command.push(template.to_string());
    command.push(request.url.clone());
    command
}

/// Exit codes at or below zero count as success; signal deaths do not
fn exit_succeeded(status: &ExitStatus) -> bool {
    status.code().is_some_and(|code| code <= 0)
}

async fn run_process(
    task: &Task,
    command_line: &[String],
    log_file: &Path,
) -> crate::Result<ExitStatus> {
    let (program, args) = command_line
        .split_first()
        .ok_or_else(|| Error::ExternalTool("empty command line".into()))?;

    let stdout = tokio::fs::File::create(log_file).await?.into_std().await;
    let stderr = stdout.try_clone()?;

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::ExternalTool(format!("failed to start {program}: {e}")))?;

    task.process_started(ProcessInfo {
        pid: child.id().unwrap_or_default(),
        command: program.clone(),
        arguments: args.to_vec(),
        command_line: command_line.join(" "),
        start_time: chrono::Utc::now(),
    });

    Ok(child.wait().await?)
}

async fn expire(env: &TaskEnv, task: &Task) {
    tokio::time::sleep(env.tasks.completion_grace).await;
    task.advance(TaskStatus::ShuttingDown);
    debug!(task_id = %task.id(), "Task shutting down");

    tokio::time::sleep(env.tasks.shutdown_grace).await;
    env.table.write().await.remove(task);

    files::remove_quietly(&files::log_path(&env.storage, task.id())).await;
    if let Some(output) = files::find_output(&env.storage.holding_dir, task.id()).await {
        files::remove_quietly(&output).await;
    }
    info!(task_id = %task.id(), "Task removed");
}
