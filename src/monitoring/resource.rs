//! Process Tree Resource Sampling
//!
//! Measures resident memory of a process and all of its descendants,
//! keeping the running peak for the task that owns the tree.

use std::collections::HashMap;

use log::debug;
use sysinfo::{Pid, ProcessRefreshKind, System};

/// Samples the resident memory of one process tree.
///
/// # Example
///
/// ```rust,ignore
/// use bear::monitoring::ProcessTreeProbe;
///
/// let mut probe = ProcessTreeProbe::new(child.id());
/// while let Some(rss) = probe.sample() {
///     println!("tree rss: {} bytes (peak {})", rss, probe.peak());
///     std::thread::sleep(std::time::Duration::from_millis(100));
/// }
/// ```
pub struct ProcessTreeProbe {
    system: System,
    root: Pid,
    peak: u64,
    samples: usize,
}

impl ProcessTreeProbe {
    /// Creates a probe rooted at `pid`.
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            root: Pid::from_u32(pid),
            peak: 0,
            samples: 0,
        }
    }

    /// Refreshes the process table and returns the tree's current RSS.
    ///
    /// Returns `None` once the root process no longer exists.
    pub fn sample(&mut self) -> Option<u64> {
        self.refresh();
        let total = tree_memory(&self.system, self.root)?;

        self.samples += 1;
        if total > self.peak {
            self.peak = total;
        }
        Some(total)
    }

    /// Highest RSS seen so far, in bytes.
    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// Number of successful samples taken.
    pub fn sample_count(&self) -> usize {
        self.samples
    }

    /// Kills every descendant of the root, deepest first, then the root.
    ///
    /// Returns how many processes accepted the signal.
    pub fn kill_tree(&mut self) -> usize {
        self.refresh();

        let mut targets = descendants(&self.system, self.root);
        targets.reverse();
        targets.push(self.root);

        targets
            .into_iter()
            .filter_map(|pid| self.system.process(pid))
            .filter(|process| process.kill())
            .count()
    }

    fn refresh(&mut self) {
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new().with_memory());
    }
}

/// Pids of all descendant processes of `root`, parents before children.
///
/// Thread entries are skipped: on Linux the process table lists every
/// thread with its owning process as parent.
pub fn descendants(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            if parent != *pid {
                children.entry(parent).or_default().push(*pid);
            }
        }
    }

    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                if !found.contains(kid) && *kid != root {
                    found.push(*kid);
                    frontier.push(*kid);
                }
            }
        }
    }
    found
}

/// Summed RSS of `root` and its descendants, `None` if `root` is gone.
pub fn tree_memory(system: &System, root: Pid) -> Option<u64> {
    let own = system.process(root)?.memory();
    let rest: u64 = descendants(system, root)
        .into_iter()
        .filter_map(|pid| system.process(pid))
        .map(|process| process.memory())
        .sum();

    debug!("Process tree {} rss: {} bytes", root, own + rest);
    Some(own + rest)
}
