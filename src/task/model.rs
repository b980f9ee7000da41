//! Task Data Model
//!
//! A [`Task`] is the smallest schedulable unit: one command or one
//! registered function invocation, tracked through
//! `Created -> Started -> {Succeeded | Failed}`.
//!
//! The terminal fields live in an [`Outcome`] that is built once by the
//! task's monitor and never mutated afterwards; readers get a shared
//! snapshot of it.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::TaskFailure;

/// Number of hex characters kept from the identity digest.
const IDENTITY_LEN: usize = 32;

/// What a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Caller {
    /// Shell command text, run through `sh -c`
    Command(String),
    /// Name of a function registered with the worker
    Function(String),
}

impl Caller {
    pub fn command(text: impl Into<String>) -> Self {
        Caller::Command(text.into())
    }

    pub fn function(name: impl Into<String>) -> Self {
        Caller::Function(name.into())
    }

    /// Command text or function name.
    pub fn name(&self) -> &str {
        match self {
            Caller::Command(text) => text,
            Caller::Function(name) => name,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Caller::Command(_) => "command",
            Caller::Function(_) => "function",
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Created but not yet admitted
    Created,
    /// Process running, monitor attached
    Started,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
}

impl TaskState {
    /// Terminal states are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Created => "Created",
            TaskState::Started => "Started",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Redirection of one standard stream of a command task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdioMode {
    /// Captured by the monitor
    #[default]
    Piped,
    /// Shared with the controlling process
    Inherit,
    /// Connected to the null device
    Null,
    /// Appended to a file, created if missing
    File(PathBuf),
}

/// Per-task configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    /// Deadline after which the monitor kills the process tree
    pub timeout: Option<Duration>,
    /// Advisory memory reservation in bytes (recorded, not enforced)
    pub reserved_mem: Option<u64>,
    /// Standard input of command tasks
    pub stdin: StdioMode,
    /// Standard output of command tasks
    pub stdout: StdioMode,
    /// Standard error of command tasks
    pub stderr: StdioMode,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            reserved_mem: None,
            stdin: StdioMode::Null,
            stdout: StdioMode::Piped,
            stderr: StdioMode::Piped,
        }
    }
}

impl TaskOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_reserved_mem(mut self, bytes: u64) -> Self {
        self.reserved_mem = Some(bytes);
        self
    }

    pub fn with_stdin(mut self, mode: StdioMode) -> Self {
        self.stdin = mode;
        self
    }

    pub fn with_stdout(mut self, mode: StdioMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn with_stderr(mut self, mode: StdioMode) -> Self {
        self.stderr = mode;
        self
    }
}

/// Terminal attributes of a task, written once.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// `Succeeded` or `Failed`
    pub state: TaskState,
    /// OS process id, if a process was ever spawned
    pub pid: Option<u32>,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    /// Peak resident memory of the process tree in bytes
    pub max_mem: u64,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Outcome {
    pub fn succeeded(
        start_time: DateTime<Local>,
        end_time: DateTime<Local>,
        pid: Option<u32>,
        max_mem: u64,
        result: Option<Value>,
    ) -> Self {
        Self {
            state: TaskState::Succeeded,
            pid,
            start_time,
            end_time,
            max_mem,
            result,
            error: None,
        }
    }

    pub fn failed(
        start_time: DateTime<Local>,
        end_time: DateTime<Local>,
        pid: Option<u32>,
        max_mem: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            state: TaskState::Failed,
            pid,
            start_time,
            end_time,
            max_mem,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Wall-clock run time.
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time).to_std().unwrap_or_default()
    }
}

#[derive(Debug)]
enum Lifecycle {
    Created,
    Started {
        start_time: DateTime<Local>,
        pid: u32,
    },
    Finished(Arc<Outcome>),
}

/// A unit of work.
///
/// Tasks are shared as `Arc<Task>` between the pipeline, the backend and
/// the task's monitor. Only the monitor (or the backend on spawn failure)
/// finishes a task; everyone else reads.
#[derive(Debug)]
pub struct Task {
    id: String,
    group_id: usize,
    caller: Caller,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    options: TaskOptions,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

impl Task {
    /// Creates a standalone task whose identity is derived from its call.
    pub fn new(
        caller: Caller,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: TaskOptions,
    ) -> Self {
        let id = identity(&caller, &args, &kwargs);
        Self::with_id(id, 0, caller, args, kwargs, options)
    }

    pub(crate) fn with_id(
        id: String,
        group_id: usize,
        caller: Caller,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: TaskOptions,
    ) -> Self {
        Self {
            id,
            group_id,
            caller,
            args,
            kwargs,
            options,
            lifecycle: Mutex::new(Lifecycle::Created),
            changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Batch that created this task.
    pub fn group_id(&self) -> usize {
        self.group_id
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Command text or function name, used for reporting.
    pub fn func_name(&self) -> &str {
        self.caller.name()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TaskState {
        match &*self.lock() {
            Lifecycle::Created => TaskState::Created,
            Lifecycle::Started { .. } => TaskState::Started,
            Lifecycle::Finished(outcome) => outcome.state,
        }
    }

    pub fn start_time(&self) -> Option<DateTime<Local>> {
        match &*self.lock() {
            Lifecycle::Created => None,
            Lifecycle::Started { start_time, .. } => Some(*start_time),
            Lifecycle::Finished(outcome) => Some(outcome.start_time),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match &*self.lock() {
            Lifecycle::Created => None,
            Lifecycle::Started { pid, .. } => Some(*pid),
            Lifecycle::Finished(outcome) => outcome.pid,
        }
    }

    /// Snapshot of the terminal attributes, if the task has finished.
    pub fn outcome(&self) -> Option<Arc<Outcome>> {
        match &*self.lock() {
            Lifecycle::Finished(outcome) => Some(Arc::clone(outcome)),
            _ => None,
        }
    }

    pub fn end_time(&self) -> Option<DateTime<Local>> {
        self.outcome().map(|o| o.end_time)
    }

    pub fn max_mem(&self) -> Option<u64> {
        self.outcome().map(|o| o.max_mem)
    }

    pub fn result(&self) -> Option<Value> {
        self.outcome().and_then(|o| o.result.clone())
    }

    pub fn error(&self) -> Option<String> {
        self.outcome().and_then(|o| o.error.clone())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.outcome().map(|o| o.duration())
    }

    /// Blocks until the task finishes and returns its outcome.
    pub fn join(&self) -> Arc<Outcome> {
        let mut guard = self.lock();
        loop {
            if let Lifecycle::Finished(outcome) = &*guard {
                return Arc::clone(outcome);
            }
            guard = self
                .changed
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Task::join`], giving up after `timeout`.
    pub fn join_timeout(&self, timeout: Duration) -> Option<Arc<Outcome>> {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |l| !matches!(l, Lifecycle::Finished(_)))
            .unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Lifecycle::Finished(outcome) => Some(Arc::clone(outcome)),
            _ => None,
        }
    }

    /// Waits for the task and returns its result, or its failure.
    ///
    /// Calling this again on a finished task returns the same cached
    /// result or error.
    pub fn wait(&self) -> Result<Value, TaskFailure> {
        let outcome = self.join();
        match outcome.state {
            TaskState::Succeeded => Ok(outcome.result.clone().unwrap_or(Value::Null)),
            _ => Err(self.failure(&outcome)),
        }
    }

    fn failure(&self, outcome: &Outcome) -> TaskFailure {
        TaskFailure {
            id: self.id.clone(),
            caller: self.caller.to_string(),
            args: self.describe_args(),
            message: outcome
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
    }

    fn describe_args(&self) -> String {
        let args = Value::Array(self.args.clone());
        if self.kwargs.is_empty() {
            args.to_string()
        } else {
            format!("{} {}", args, Value::Object(self.kwargs.clone()))
        }
    }

    /// `Created -> Started`. Returns the recorded start time.
    pub(crate) fn mark_started(&self, pid: u32) -> Option<DateTime<Local>> {
        let mut guard = self.lock();
        if !matches!(*guard, Lifecycle::Created) {
            warn!("Task {} already started, ignoring second start", self.id);
            return None;
        }
        let start_time = Local::now();
        *guard = Lifecycle::Started { start_time, pid };
        self.changed.notify_all();
        Some(start_time)
    }

    /// Moves the task to its terminal state. Only the first call wins.
    pub(crate) fn finish(&self, outcome: Outcome) -> bool {
        let mut guard = self.lock();
        if matches!(*guard, Lifecycle::Finished(_)) {
            warn!("Task {} already finished, ignoring second finalize", self.id);
            return false;
        }
        *guard = Lifecycle::Finished(Arc::new(outcome));
        self.changed.notify_all();
        true
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

/// Deterministic identity of a call.
///
/// SHA-256 over the caller kind and name plus the JSON of the arguments.
/// Object keys serialize in sorted order, so equal calls hash equally.
pub fn identity(caller: &Caller, args: &[Value], kwargs: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(caller.kind().as_bytes());
    hasher.update([0u8]);
    hasher.update(caller.name().as_bytes());
    hasher.update([0u8]);
    hasher.update(Value::Array(args.to_vec()).to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(Value::Object(kwargs.clone()).to_string().as_bytes());

    let mut digest = format!("{:x}", hasher.finalize());
    digest.truncate(IDENTITY_LEN);
    digest
}
