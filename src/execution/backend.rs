//! Task Launching
//!
//! Starts a task as an OS process and attaches its monitor:
//! - Command tasks run through `sh -c` with configurable stdio
//! - Function tasks run in an isolated worker process that receives
//!   the call on stdin and replies on stdout
//!
//! Spawn failures are reported synchronously: the task is finished as
//! `Failed` before [`Launcher::start`] returns.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Local;
use log::{error, info};
use serde_json::Value;

use super::monitor::Monitor;
use super::protocol::CallRequest;
use super::worker::WORKER_ARG;
use crate::task::{Caller, Outcome, StdioMode, Task};

/// Shell used for command tasks.
const SHELL: &str = "sh";

/// `$0` seen by command tasks.
const SHELL_ARG0: &str = "bear";

/// Default interval between memory samples.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default wait for a finished process's output to arrive.
pub const DEFAULT_RESULT_GRACE: Duration = Duration::from_millis(500);

/// Program invoked to run function tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// `program __bear-worker`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![WORKER_ARG.to_string()],
        }
    }

    /// The running executable in worker mode.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Replaces the worker arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::current_exe().unwrap_or_else(|_| Self::new("bear"))
    }
}

/// Starts tasks and attaches a monitor to each.
#[derive(Debug, Clone)]
pub struct Launcher {
    worker: WorkerCommand,
    poll_interval: Duration,
    result_grace: Duration,
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new(WorkerCommand::default(), DEFAULT_POLL_INTERVAL, DEFAULT_RESULT_GRACE)
    }
}

impl Launcher {
    pub fn new(worker: WorkerCommand, poll_interval: Duration, result_grace: Duration) -> Self {
        Self {
            worker,
            poll_interval,
            result_grace,
        }
    }

    /// Starts `task` and attaches its monitor.
    ///
    /// Returns `true` if a monitor now owns the task; it will send
    /// `position` on `done` once the task is finished. Returns `false`
    /// if the task could not be spawned, in which case it is already
    /// finished as `Failed` and nothing is sent.
    pub fn start(&self, task: &Arc<Task>, position: usize, done: Sender<usize>) -> bool {
        let mut command = match self.build_command(task) {
            Ok(command) => command,
            Err(e) => {
                fail_to_spawn(task, &e);
                return false;
            }
        };

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                fail_to_spawn(task, &e);
                return false;
            }
        };

        let pid = child.id();
        let Some(start_time) = task.mark_started(pid) else {
            let mut child = child;
            child.kill().ok();
            child.wait().ok();
            return false;
        };

        info!(
            "Task {} PID: {} is running {}{}",
            task.id(),
            pid,
            task.func_name(),
            Value::Array(task.args().to_vec())
        );

        let request = match task.caller() {
            Caller::Function(name) => Some(CallRequest {
                function: name.clone(),
                args: task.args().to_vec(),
                kwargs: task.kwargs().clone(),
            }),
            Caller::Command(_) => None,
        };

        let monitor = Monitor::new(
            Arc::clone(task),
            child,
            start_time,
            request,
            self.poll_interval,
            self.result_grace,
            done,
            position,
        );

        let name = format!("bear-monitor-{}", task.id().chars().take(8).collect::<String>());
        if let Err(e) = thread::Builder::new().name(name).spawn(move || monitor.run()) {
            // The dropped monitor kills the child and finishes the task
            error!("Failed to start monitor for task {}: {}", task.id(), e);
        }
        true
    }

    fn build_command(&self, task: &Task) -> io::Result<Command> {
        match task.caller() {
            Caller::Command(text) => {
                let options = task.options();
                let mut command = Command::new(SHELL);
                command
                    .arg("-c")
                    .arg(text)
                    .arg(SHELL_ARG0)
                    .args(task.args().iter().map(shell_arg))
                    .stdin(stdio(&options.stdin)?)
                    .stdout(stdio(&options.stdout)?)
                    .stderr(stdio(&options.stderr)?);
                Ok(command)
            }
            Caller::Function(_) => {
                let mut command = Command::new(&self.worker.program);
                command
                    .args(&self.worker.args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                Ok(command)
            }
        }
    }
}

fn fail_to_spawn(task: &Task, e: &io::Error) {
    let message = format!("failed to spawn {}: {}", task.func_name(), e);
    error!("Task {} {}", task.id(), message);
    let now = Local::now();
    task.finish(Outcome::failed(now, now, None, 0, message));
}

/// Positional parameter text: strings verbatim, anything else as JSON.
fn shell_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn stdio(mode: &StdioMode) -> io::Result<Stdio> {
    Ok(match mode {
        StdioMode::Piped => Stdio::piped(),
        StdioMode::Inherit => Stdio::inherit(),
        StdioMode::Null => Stdio::null(),
        StdioMode::File(path) => Stdio::from(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskOptions, TaskState};
    use serde_json::{json, Map};
    use std::fs;
    use std::sync::mpsc::channel;
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_secs(20);

    fn task(caller: Caller, args: Vec<Value>, options: TaskOptions) -> Arc<Task> {
        Arc::new(Task::new(caller, args, Map::new(), options))
    }

    fn run_with(launcher: &Launcher, task: &Arc<Task>) {
        let (tx, rx) = channel();
        assert!(launcher.start(task, 3, tx), "task should have started");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 3);
    }

    fn run(task: &Arc<Task>) {
        run_with(&Launcher::default(), task);
    }

    fn fake_worker(script: &str) -> Launcher {
        Launcher::new(
            WorkerCommand::new("sh").with_args(["-c", script]),
            DEFAULT_POLL_INTERVAL,
            DEFAULT_RESULT_GRACE,
        )
    }

    #[test]
    fn test_command_success_captures_stdout() {
        let task = task(Caller::command("echo hello"), vec![], TaskOptions::default());
        run(&task);

        assert_eq!(task.state(), TaskState::Succeeded);
        assert_eq!(task.result(), Some(json!("hello\n")));
        assert!(task.pid().is_some());
        assert!(task.end_time() >= task.start_time());
    }

    #[test]
    fn test_unbounded_timeout_runs_normally() {
        let task = task(
            Caller::command("echo hi"),
            vec![],
            TaskOptions::default().with_timeout(Duration::MAX),
        );
        run(&task);

        assert_eq!(task.state(), TaskState::Succeeded);
        assert_eq!(task.result(), Some(json!("hi\n")));
    }

    #[test]
    fn test_command_positional_args() {
        let task = task(
            Caller::command("echo \"$1-$2\""),
            vec![json!("a"), json!(2)],
            TaskOptions::default(),
        );
        run(&task);
        assert_eq!(task.wait().unwrap(), json!("a-2\n"));
    }

    #[test]
    fn test_command_failure_reports_stderr() {
        let task = task(
            Caller::command("echo oops >&2; exit 3"),
            vec![],
            TaskOptions::default(),
        );
        run(&task);

        assert_eq!(task.state(), TaskState::Failed);
        let error = task.error().unwrap();
        assert!(error.contains('3'), "unexpected error: {}", error);
        assert!(error.contains("oops"), "unexpected error: {}", error);
        assert!(task.result().is_none());
    }

    #[test]
    fn test_command_memory_is_sampled() {
        let task = task(Caller::command("sleep 0.5"), vec![], TaskOptions::default());
        run(&task);
        assert!(task.max_mem().unwrap() > 0);
    }

    #[test]
    fn test_command_stdout_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let options = TaskOptions::default().with_stdout(StdioMode::File(path.clone()));

        let task = task(Caller::command("echo hello"), vec![], options);
        run(&task);

        assert_eq!(task.state(), TaskState::Succeeded);
        assert_eq!(task.result(), None);
        assert!(fs::read_to_string(&path).unwrap().contains("hello"));
    }

    #[test]
    fn test_timeout_kills_process() {
        let options = TaskOptions::default().with_timeout(Duration::from_millis(300));
        let task = task(Caller::command("sleep 10"), vec![], options);
        run(&task);

        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.error().unwrap().contains("timed out"));
        assert!(task.duration().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn test_spawn_failure_is_immediate() {
        let launcher = Launcher::new(
            WorkerCommand::new("/nonexistent/bear-worker"),
            DEFAULT_POLL_INTERVAL,
            DEFAULT_RESULT_GRACE,
        );
        let task = task(Caller::function("add"), vec![json!(1), json!(2)], TaskOptions::default());
        let (tx, rx) = channel();

        assert!(!launcher.start(&task, 0, tx));
        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.error().unwrap().contains("failed to spawn"));
        assert!(task.start_time().is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_spawn_failure_on_unopenable_file() {
        let options = TaskOptions::default()
            .with_stdout(StdioMode::File(PathBuf::from("/nonexistent/dir/out.txt")));
        let task = task(Caller::command("echo hi"), vec![], options);
        let (tx, _rx) = channel();

        assert!(!Launcher::default().start(&task, 0, tx));
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[test]
    fn test_worker_reply_is_result() {
        let launcher = fake_worker(
            "cat > /dev/null; printf '@@bear-reply@@ {\"result\":7,\"error\":null}\\n'",
        );
        let task = task(Caller::function("seven"), vec![], TaskOptions::default());
        run_with(&launcher, &task);

        assert_eq!(task.wait().unwrap(), json!(7));
    }

    #[test]
    fn test_worker_error_reply_fails_task() {
        let launcher = fake_worker(
            "cat > /dev/null; printf '@@bear-reply@@ {\"result\":null,\"error\":\"bad input\"}\\n'; exit 1",
        );
        let task = task(Caller::function("f"), vec![json!(1)], TaskOptions::default());
        run_with(&launcher, &task);

        let failure = task.wait().unwrap_err();
        assert_eq!(failure.message, "bad input");
        assert_eq!(failure.caller, "f");
    }

    #[test]
    fn test_worker_without_reply_fails_task() {
        let launcher = fake_worker("cat > /dev/null; exit 0");
        let task = task(Caller::function("f"), vec![], TaskOptions::default());
        run_with(&launcher, &task);

        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.error().unwrap().contains("without a reply"));
    }

    #[test]
    fn test_worker_nonzero_exit_fails_task() {
        let launcher = fake_worker(
            "cat > /dev/null; printf '@@bear-reply@@ {\"result\":1,\"error\":null}\\n'; exit 4",
        );
        let task = task(Caller::function("f"), vec![], TaskOptions::default());
        run_with(&launcher, &task);

        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.error().unwrap().contains("worker exited"));
    }

    #[test]
    fn test_worker_receives_request() {
        let launcher = fake_worker(
            "read -r line; case \"$line\" in *'\"function\":\"echo\"'*) \
             printf '@@bear-reply@@ {\"result\":\"got it\",\"error\":null}\\n';; \
             *) exit 9;; esac",
        );
        let task = task(Caller::function("echo"), vec![json!(1)], TaskOptions::default());
        run_with(&launcher, &task);

        assert_eq!(task.wait().unwrap(), json!("got it"));
    }

    #[test]
    fn test_shell_arg_rendering() {
        assert_eq!(shell_arg(&json!("plain")), "plain");
        assert_eq!(shell_arg(&json!(3)), "3");
        assert_eq!(shell_arg(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_worker_command_defaults() {
        let worker = WorkerCommand::new("/usr/bin/bear");
        assert_eq!(worker.args, vec![WORKER_ARG.to_string()]);
    }
}
