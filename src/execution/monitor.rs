//! Per-Task Monitor
//!
//! One monitor thread per running task. It samples the task's process
//! tree memory at a fixed interval, notices when the process exits,
//! enforces the task timeout, and finalizes the task exactly once.

use std::io::{Read, Write};
use std::process::{Child, ExitStatus};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde_json::Value;

use super::protocol::{decode_output, CallRequest};
use crate::monitoring::ProcessTreeProbe;
use crate::task::{Caller, Outcome, Task};

/// How the watched process ended.
enum Exit {
    Status(ExitStatus),
    TimedOut(Duration),
    WaitFailed(std::io::Error),
}

/// Watches one running task.
///
/// Dropping a monitor sends its completion notice. If the task was not
/// finished by then (the monitor thread never ran or panicked), the
/// process is killed and the task is finished as `Failed` first, so
/// nobody waits on it forever.
pub(crate) struct Monitor {
    task: Arc<Task>,
    child: Child,
    start_time: DateTime<Local>,
    request: Option<CallRequest>,
    poll_interval: Duration,
    result_grace: Duration,
    done: Sender<usize>,
    position: usize,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        task: Arc<Task>,
        child: Child,
        start_time: DateTime<Local>,
        request: Option<CallRequest>,
        poll_interval: Duration,
        result_grace: Duration,
        done: Sender<usize>,
        position: usize,
    ) -> Self {
        Self {
            task,
            child,
            start_time,
            request,
            poll_interval,
            result_grace,
            done,
            position,
        }
    }

    /// Watches the process until it exits, then finalizes the task.
    pub(crate) fn run(mut self) {
        let stdout = self.child.stdout.take().map(spawn_reader);
        let stderr = self.child.stderr.take().map(spawn_reader);
        self.send_request();

        let mut probe = ProcessTreeProbe::new(self.child.id());
        let exit = self.watch(&mut probe);

        let end_time = Local::now();
        let stdout = stdout.and_then(|rx| self.collect(rx, "stdout"));
        let stderr = stderr.and_then(|rx| self.collect(rx, "stderr"));

        let resolved = match exit {
            Exit::Status(status) => match self.task.caller() {
                Caller::Command(_) => resolve_command(status, stdout, stderr),
                Caller::Function(_) => resolve_call(status, stdout, stderr),
            },
            Exit::TimedOut(timeout) => Err(format!("timed out after {:?}", timeout)),
            Exit::WaitFailed(e) => Err(format!("failed to wait on process: {}", e)),
        };

        let pid = Some(self.child.id());
        let max_mem = probe.peak();
        debug!(
            "Task {} peaked at {} bytes over {} samples",
            self.task.id(),
            max_mem,
            probe.sample_count()
        );
        let outcome = match resolved {
            Ok(result) => {
                info!("Task {} is done", self.task.id());
                Outcome::succeeded(self.start_time, end_time, pid, max_mem, result)
            }
            Err(error) => {
                warn!("Task {} failed: {}", self.task.id(), error);
                Outcome::failed(self.start_time, end_time, pid, max_mem, error)
            }
        };
        self.task.finish(outcome);
    }

    /// Polls until exit, sampling memory on every tick.
    fn watch(&mut self, probe: &mut ProcessTreeProbe) -> Exit {
        let timeout = self.task.options().timeout;
        // A deadline past the end of the clock never fires
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            let alive = probe.sample().is_some();

            match self.child.try_wait() {
                Ok(Some(status)) => return Exit::Status(status),
                Ok(None) => {}
                Err(e) => return Exit::WaitFailed(e),
            }

            if !alive {
                // Gone from the process table between polls
                debug!("Task {} process vanished, reaping", self.task.id());
                return match self.child.wait() {
                    Ok(status) => Exit::Status(status),
                    Err(e) => Exit::WaitFailed(e),
                };
            }

            if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                if Instant::now() >= deadline {
                    warn!("Task {} exceeded {:?}, killing process tree", self.task.id(), timeout);
                    probe.kill_tree();
                    self.child.kill().ok();
                    self.child.wait().ok();
                    return Exit::TimedOut(timeout);
                }
            }

            thread::sleep(self.poll_interval);
        }
    }

    fn send_request(&mut self) {
        let Some(mut stdin) = self.child.stdin.take() else {
            return;
        };
        let Some(request) = self.request.take() else {
            return;
        };

        let sent = serde_json::to_vec(&request)
            .map_err(std::io::Error::from)
            .and_then(|bytes| stdin.write_all(&bytes))
            .and_then(|_| stdin.flush());
        if let Err(e) = sent {
            warn!("Failed to send call to worker of task {}: {}", self.task.id(), e);
        }
        // Dropping stdin closes it; the worker reads until EOF
    }

    fn collect(&self, rx: Receiver<Vec<u8>>, stream: &str) -> Option<Vec<u8>> {
        match rx.recv_timeout(self.result_grace) {
            Ok(bytes) => Some(bytes),
            Err(_) => {
                warn!(
                    "Task {} {} still open {:?} after exit, giving up on it",
                    self.task.id(),
                    stream,
                    self.result_grace
                );
                None
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if !self.task.state().is_terminal() {
            self.child.kill().ok();
            self.child.wait().ok();
            self.task.finish(Outcome::failed(
                self.start_time,
                Local::now(),
                Some(self.child.id()),
                0,
                "monitor stopped before the task finished",
            ));
        }
        // The receiver is gone once its admitter has moved on
        self.done.send(self.position).ok();
    }
}

/// Reads a stream to EOF on its own thread.
fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = channel();
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Err(e) = stream.read_to_end(&mut buffer) {
            debug!("Stream read ended with error: {}", e);
        }
        tx.send(buffer).ok();
    });
    rx
}

fn stderr_suffix(stderr: &Option<Vec<u8>>) -> String {
    match stderr {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let text = text.trim();
            if text.is_empty() {
                String::new()
            } else {
                format!(": {}", text)
            }
        }
        None => String::new(),
    }
}

/// Command tasks: success iff exit code 0; captured stdout is the result.
fn resolve_command(
    status: ExitStatus,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
) -> Result<Option<Value>, String> {
    if status.success() {
        Ok(stdout.map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned())))
    } else {
        Err(format!("command {}{}", status, stderr_suffix(&stderr)))
    }
}

/// Function tasks: the reply decides, then the worker's exit status.
fn resolve_call(
    status: ExitStatus,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
) -> Result<Option<Value>, String> {
    let Some(stdout) = stdout else {
        return Err(format!(
            "worker result channel did not close{}",
            stderr_suffix(&stderr)
        ));
    };

    let (reply, printed) = decode_output(&stdout);
    if !printed.is_empty() {
        debug!("Worker output:\n{}", printed);
    }

    match reply {
        None => Err(format!(
            "worker closed the result channel without a reply ({}){}",
            status,
            stderr_suffix(&stderr)
        )),
        Some(reply) if reply.is_error() => Err(reply.error.unwrap_or_default()),
        Some(_) if !status.success() => Err(format!(
            "worker exited with {}{}",
            status,
            stderr_suffix(&stderr)
        )),
        Some(reply) => Ok(reply.result),
    }
}
