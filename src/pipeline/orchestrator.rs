//! Batch Orchestrator
//!
//! The [`Pipeline`] turns a [`Batch`] (one caller plus a list of
//! argument sets) into tasks, admits them under a concurrency ceiling,
//! and collects their results.
//!
//! Admission is event-driven: each batch owns a completion channel,
//! every monitor sends its task's batch position once the task is
//! finished, and the admitter only blocks on that channel while the
//! ceiling is reached. At most `ceiling` tasks of a batch are ever in
//! the `Started` state at once, and tasks are admitted in argument-set
//! order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Local;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use super::config::PipelineConfig;
use super::resume::{self, ResumeStore};
use crate::error::{Error, Result, TaskFailure};
use crate::execution::Launcher;
use crate::monitoring::{ChartData, HostSample, HostSampler};
use crate::task::{self, identity, Caller, Outcome, Task, TaskOptions, TaskState, TaskStats};

/// Keyword arguments of a batch.
#[derive(Debug, Clone, PartialEq)]
enum KwargSets {
    /// The same keyword arguments for every task
    Shared(Map<String, Value>),
    /// One set per task, matched to argument sets by position
    PerTask(Vec<Map<String, Value>>),
}

/// One caller applied to a list of argument sets.
///
/// # Example
///
/// ```rust,no_run
/// use bear::{Batch, Pipeline};
/// use serde_json::json;
///
/// fn main() -> bear::Result<()> {
///     let mut pipeline = Pipeline::new()?;
///     let sums = pipeline.dispatch_sync(
///         Batch::function("add")
///             .args(vec![vec![json!(1), json!(2)], vec![json!(2), json!(3)]])
///             .concurrency(2),
///     )?;
///     assert_eq!(sums, vec![json!(3), json!(5)]);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    caller: Caller,
    arg_sets: Vec<Vec<Value>>,
    kwargs: KwargSets,
    concurrency: Option<usize>,
    options: TaskOptions,
}

impl Batch {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            arg_sets: Vec::new(),
            kwargs: KwargSets::Shared(Map::new()),
            concurrency: None,
            options: TaskOptions::default(),
        }
    }

    /// Batch of a registered function.
    pub fn function(name: impl Into<String>) -> Self {
        Self::new(Caller::function(name))
    }

    /// Batch of a shell command; arguments become `$1`, `$2`, ...
    pub fn command(text: impl Into<String>) -> Self {
        Self::new(Caller::command(text))
    }

    /// Appends argument sets, one task each.
    pub fn args<I>(mut self, arg_sets: I) -> Self
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        self.arg_sets.extend(arg_sets);
        self
    }

    /// Keyword arguments shared by every task.
    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = KwargSets::Shared(kwargs);
        self
    }

    /// One keyword argument set per task.
    pub fn kwarg_sets(mut self, kwarg_sets: Vec<Map<String, Value>>) -> Self {
        self.kwargs = KwargSets::PerTask(kwarg_sets);
        self
    }

    /// Maximum number of tasks of this batch running at once.
    pub fn concurrency(mut self, ceiling: usize) -> Self {
        self.concurrency = Some(ceiling);
        self
    }

    pub fn options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn ceiling(&self) -> Option<usize> {
        self.concurrency
    }

    /// Number of tasks this batch creates.
    pub fn len(&self) -> usize {
        match &self.kwargs {
            KwargSets::Shared(_) => self.arg_sets.len(),
            KwargSets::PerTask(sets) => self.arg_sets.len().max(sets.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(Error::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }

        if let KwargSets::PerTask(sets) = &self.kwargs {
            if !self.arg_sets.is_empty() && sets.len() != self.arg_sets.len() {
                return Err(Error::InvalidConfig(format!(
                    "{} argument sets but {} keyword argument sets",
                    self.arg_sets.len(),
                    sets.len()
                )));
            }
        }

        Ok(())
    }

    /// Splits the batch into per-task calls.
    fn calls(self) -> (Caller, TaskOptions, Vec<(Vec<Value>, Map<String, Value>)>) {
        let count = self.len();
        let mut arg_sets = self.arg_sets.into_iter();
        let calls: Vec<(Vec<Value>, Map<String, Value>)> = match self.kwargs {
            KwargSets::Shared(kwargs) => arg_sets.map(|args| (args, kwargs.clone())).collect(),
            KwargSets::PerTask(sets) => sets
                .into_iter()
                .map(|kwargs| (arg_sets.next().unwrap_or_default(), kwargs))
                .collect(),
        };
        debug_assert_eq!(count, calls.len());
        (self.caller, self.options, calls)
    }
}

/// Runs batches of tasks and keeps every task it created.
pub struct Pipeline {
    config: PipelineConfig,
    launcher: Launcher,
    resume: Option<ResumeStore>,
    tasks: Vec<Arc<Task>>,
    group_count: usize,
    sampler: Option<HostSampler>,
    admitters: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Pipeline {
    /// Pipeline with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(PipelineConfig::default())
    }

    /// Validates `config` and starts the host sampler if one is configured.
    pub fn with_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let sampler = match config.memory_monitor_interval {
            Some(interval) => {
                let mut sampler = HostSampler::new(interval)?;
                sampler.start()?;
                Some(sampler)
            }
            None => None,
        };

        let resume = config
            .resume
            .then(|| ResumeStore::new(config.resume_path.clone()));
        let launcher = Launcher::new(
            config.worker.clone(),
            config.poll_interval,
            config.result_grace,
        );

        Ok(Self {
            config,
            launcher,
            resume,
            tasks: Vec::new(),
            group_count: 0,
            sampler,
            admitters: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Every task created so far, in creation order.
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    /// Runs a batch and waits for it.
    ///
    /// Results come back in argument-set order. If any task failed, every
    /// other task still runs to completion and one
    /// [`Error::BatchFailed`] carrying the failure count is returned.
    pub fn dispatch_sync(&mut self, batch: Batch) -> Result<Vec<Value>> {
        let ceiling = batch.ceiling();
        let tasks = self.create_tasks(batch)?;

        admit(&self.launcher, &tasks, ceiling, &self.shutdown);
        let outcome = self.wait_for(&tasks);

        if let Some(store) = &self.resume {
            if let Err(e) = store.save_tasks(self.tasks.iter().map(Arc::as_ref)) {
                warn!("Failed to save resume snapshot: {}", e);
            }
        }

        outcome
    }

    /// Starts a batch in the background and returns its task handles.
    ///
    /// Admission runs on a separate thread, so the ceiling of the batch
    /// still applies.
    pub fn dispatch_async(&mut self, batch: Batch) -> Result<Vec<Arc<Task>>> {
        let ceiling = batch.ceiling();
        let tasks = self.create_tasks(batch)?;

        let launcher = self.launcher.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let admitted = tasks.clone();
        let name = format!("bear-admitter-{}", self.group_count - 1);

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || admit(&launcher, &admitted, ceiling, &shutdown))?;

        self.admitters.retain(|h| !h.is_finished());
        self.admitters.push(handle);
        Ok(tasks)
    }

    /// Waits for every task in `tasks`.
    ///
    /// Never stops early: each failure is logged and counted, and one
    /// [`Error::BatchFailed`] is returned after all tasks are finished.
    pub fn wait_for(&self, tasks: &[Arc<Task>]) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(tasks.len());
        let mut failed = 0;

        for task in tasks {
            match task.wait() {
                Ok(result) => results.push(result),
                Err(failure) => {
                    error!("{}", failure);
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(Error::BatchFailed {
                failed,
                total: tasks.len(),
            });
        }
        Ok(results)
    }

    /// Blocks until every task created by this pipeline is finished.
    pub fn wait_all(&mut self) {
        for task in &self.tasks {
            task.join();
        }
        // Every task is terminal, so each admitter has returned or is about to
        for handle in self.admitters.drain(..) {
            if handle.join().is_err() {
                error!("Admitter thread panicked");
            }
        }
    }

    /// Waits for everything and returns each task's result or failure,
    /// in creation order.
    pub fn results(&self) -> Vec<std::result::Result<Value, TaskFailure>> {
        self.tasks.iter().map(|task| task.wait()).collect()
    }

    /// Summaries of every task, in creation order.
    ///
    /// Blocks until tasks from async batches have finished; use
    /// [`Pipeline::finished_stats`] for a snapshot that does not wait.
    pub fn stats(&self) -> Vec<TaskStats> {
        self.tasks
            .iter()
            .map(|task| TaskStats::new(task, &task.join()))
            .collect()
    }

    /// Summaries of the tasks that have finished so far. Tasks still
    /// queued or running are left out.
    pub fn finished_stats(&self) -> Vec<TaskStats> {
        self.tasks
            .iter()
            .filter_map(|task| task.outcome().map(|o| TaskStats::new(task, &o)))
            .collect()
    }

    /// Writes [`Pipeline::stats`] as JSON once every task has finished.
    pub fn save_stats(&self, path: impl AsRef<Path>) -> Result<()> {
        task::save_stats(path, &self.stats())
    }

    /// Copy of the host memory log, empty without a sampler.
    pub fn host_samples(&self) -> Vec<HostSample> {
        self.sampler
            .as_ref()
            .map(HostSampler::samples)
            .unwrap_or_default()
    }

    /// Stats of finished tasks and host samples for chart rendering.
    ///
    /// Sampling is paused while the log is copied.
    pub fn chart_data(&self) -> ChartData {
        let host = match &self.sampler {
            Some(sampler) => {
                let was_paused = sampler.is_paused();
                sampler.pause();
                let samples = sampler.samples();
                if !was_paused {
                    sampler.resume();
                }
                samples
            }
            None => Vec::new(),
        };

        ChartData {
            tasks: self.finished_stats(),
            host,
        }
    }

    /// Stops the host sampler. Tasks are unaffected.
    pub fn terminate(&mut self) {
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.stop();
        }
    }

    /// Creates the tasks of `batch` under a new group id and restores
    /// the ones that already succeeded in a previous run.
    fn create_tasks(&mut self, batch: Batch) -> Result<Vec<Arc<Task>>> {
        batch.validate()?;

        let group_id = self.group_count;
        self.group_count += 1;

        let (caller, options, calls) = batch.calls();
        let mut seen: HashMap<String, usize> = HashMap::new();
        let tasks: Vec<Arc<Task>> = calls
            .into_iter()
            .map(|(args, kwargs)| {
                let base = identity(&caller, &args, &kwargs);
                let count = seen.entry(base.clone()).or_insert(0);
                let id = match *count {
                    0 => base,
                    n => format!("{}-{}", base, n),
                };
                *count += 1;
                Arc::new(Task::with_id(
                    id,
                    group_id,
                    caller.clone(),
                    args,
                    kwargs,
                    options.clone(),
                ))
            })
            .collect();

        let mut resumed = 0;
        if let Some(store) = &self.resume {
            let records = store.load();
            resumed = tasks
                .iter()
                .filter(|task| resume::restore(task, &records))
                .count();
        }

        info!(
            "Batch {}: {} tasks of {} ({} resumed)",
            group_id,
            tasks.len(),
            caller,
            resumed
        );

        self.tasks.extend(tasks.iter().cloned());
        Ok(tasks)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Admitters still running fail their unadmitted tasks
        self.shutdown.store(true, Ordering::SeqCst);
        self.terminate();
    }
}

/// Admits `tasks` in order, keeping at most `ceiling` of them running.
///
/// Returns once every task has been started or skipped. Tasks that are
/// already finished (resumed) are skipped. After a shutdown request the
/// remaining `Created` tasks are finished as `Failed`.
fn admit(launcher: &Launcher, tasks: &[Arc<Task>], ceiling: Option<usize>, shutdown: &AtomicBool) {
    let ceiling = ceiling.unwrap_or(usize::MAX);
    let (done_tx, done_rx) = channel();
    let mut running = 0;

    for (position, task) in tasks.iter().enumerate() {
        if task.state() != TaskState::Created {
            continue;
        }

        while running >= ceiling {
            match done_rx.recv() {
                Ok(finished) => {
                    debug!("Batch position {} finished", finished);
                    running -= 1;
                }
                Err(_) => break,
            }
        }

        if shutdown.load(Ordering::SeqCst) {
            abandon(&tasks[position..]);
            return;
        }

        if launcher.start(task, position, done_tx.clone()) {
            running += 1;
        }
    }
}

fn abandon(tasks: &[Arc<Task>]) {
    for task in tasks {
        if task.state() == TaskState::Created {
            let now = Local::now();
            if task.finish(Outcome::failed(
                now,
                now,
                None,
                0,
                "not admitted: pipeline was dropped",
            )) {
                warn!("Task {} was never admitted", task.id());
            }
        }
    }
}
