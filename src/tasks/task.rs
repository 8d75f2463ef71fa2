//! A single tracked execution of the download tool

use crate::actions::CompletionAction;
use crate::error::TaskError;
use crate::types::{DownloadRequest, ProcessInfo, TaskId, TaskStatus};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::warn;

/// Callback run once a task has finished
pub type TaskHook = Box<dyn FnOnce(&TaskOutcome) + Send + 'static>;

/// Final result of a task, handed to hooks and listeners
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Task ID
    pub task_id: TaskId,
    /// Task URL
    pub url: String,
    /// Command line of the last attempt
    pub command_line: Vec<String>,
    /// `CompleteSuccess` or `CompleteFailure`
    pub status: TaskStatus,
    /// Classified error of the last attempt, if it failed
    pub error: Option<TaskError>,
    /// Log file of the last attempt
    pub log_file: PathBuf,
    /// Output file, present only for successful tasks
    pub output_file: Option<PathBuf>,
}

impl TaskOutcome {
    /// Whether the task completed with an output
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::CompleteSuccess
    }
}

#[derive(Default)]
struct TaskState {
    status: TaskStatus,
    command_line: Vec<String>,
    process: Option<ProcessInfo>,
    error: Option<TaskError>,
    outcome: Option<TaskOutcome>,
    listeners: Vec<oneshot::Sender<TaskOutcome>>,
    success_hooks: Vec<TaskHook>,
    completion_hooks: Vec<TaskHook>,
    actions: Vec<CompletionAction>,
}

/// A download task, owned by the task table
///
/// Sessions and HTTP handlers only ever hold `Arc<Task>` references to read
/// its state or attach listeners.
pub struct Task {
    id: TaskId,
    request: DownloadRequest,
    key: String,
    state: Mutex<TaskState>,
}

impl Task {
    pub(crate) fn new(request: DownloadRequest, actions: Vec<CompletionAction>) -> Self {
        let key = request.key();
        Self {
            id: TaskId::generate(),
            request,
            key,
            state: Mutex::new(TaskState {
                actions,
                ..TaskState::default()
            }),
        }
    }

    /// Task ID
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Source URL
    pub fn url(&self) -> &str {
        &self.request.url
    }

    /// Caller arguments
    pub fn args(&self) -> &[String] {
        &self.request.args
    }

    /// Dedup key this task is registered under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current lifecycle status
    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    /// Command line of the current (or last) attempt
    pub fn command_line(&self) -> Vec<String> {
        self.lock().command_line.clone()
    }

    /// Process metadata while an attempt's process is alive
    pub fn process(&self) -> Option<ProcessInfo> {
        self.lock().process.clone()
    }

    /// Classified error of the last failed attempt
    pub fn error(&self) -> Option<TaskError> {
        self.lock().error
    }

    /// Recorded outcome, once the task has finished
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.lock().outcome.clone()
    }

    /// Completion actions bound to this task
    pub fn actions(&self) -> Vec<CompletionAction> {
        self.lock().actions.clone()
    }

    /// Wait for the outcome
    ///
    /// Fires immediately when the outcome is already recorded, otherwise
    /// exactly once when the task finishes.
    pub fn listen(&self) -> oneshot::Receiver<TaskOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        match &state.outcome {
            Some(outcome) => {
                let _ = tx.send(outcome.clone());
            }
            None => state.listeners.push(tx),
        }
        rx
    }

    /// Run `hook` if the task succeeds with an output
    ///
    /// Returns false (dropping the hook) when the task has already finished.
    pub fn on_success(&self, hook: TaskHook) -> bool {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.success_hooks.push(hook);
        true
    }

    /// Run `hook` when the task finishes, whatever the result
    ///
    /// Returns false (dropping the hook) when the task has already finished.
    pub fn on_complete(&self, hook: TaskHook) -> bool {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.completion_hooks.push(hook);
        true
    }

    pub(crate) fn advance(&self, next: TaskStatus) {
        let mut state = self.lock();
        let current = state.status;
        if current.can_advance_to(next) {
            state.status = next;
        } else {
            warn!(task_id = %self.id, from = %current, to = %next, "Ignoring backward status change");
        }
    }

    pub(crate) fn begin_attempt(&self, command_line: Vec<String>) {
        let mut state = self.lock();
        state.command_line = command_line;
        state.process = None;
    }

    pub(crate) fn process_started(&self, info: ProcessInfo) {
        let mut state = self.lock();
        state.process = Some(info);
        if state.status == TaskStatus::Initialising {
            state.status = TaskStatus::Running;
        }
    }

    pub(crate) fn process_exited(&self, error: Option<TaskError>) {
        let mut state = self.lock();
        state.process = None;
        state.error = error;
    }

    /// Record the outcome and hand back the hooks and actions to run
    ///
    /// Returns `None` if an outcome was already recorded.
    pub(crate) fn finish(&self, outcome: TaskOutcome) -> Option<Finished> {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return None;
        }
        state.status = outcome.status;
        state.error = outcome.error;
        state.process = None;
        state.outcome = Some(outcome);

        Some(Finished {
            success_hooks: std::mem::take(&mut state.success_hooks),
            completion_hooks: std::mem::take(&mut state.completion_hooks),
            actions: state.actions.clone(),
        })
    }

    /// Send the recorded outcome to every listener registered so far
    pub(crate) fn notify_listeners(&self) -> usize {
        let (listeners, outcome) = {
            let mut state = self.lock();
            (std::mem::take(&mut state.listeners), state.outcome.clone())
        };
        let Some(outcome) = outcome else {
            return 0;
        };

        let mut delivered = 0;
        for listener in listeners {
            if listener.send(outcome.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    // A panicking hook must not poison the task for readers
    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &self.status())
            .finish()
    }
}

/// Work left to do after the outcome is recorded
pub(crate) struct Finished {
    pub(crate) success_hooks: Vec<TaskHook>,
    pub(crate) completion_hooks: Vec<TaskHook>,
    pub(crate) actions: Vec<CompletionAction>,
}
