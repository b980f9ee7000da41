//! Host Memory Sampling
//!
//! Periodically records whole-machine memory usage so per-task memory
//! can be charted against the system total. The sampler's lifetime is
//! owned by the pipeline, not by any batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::error::{Error, Result};

/// Smallest accepted sampling interval.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// One whole-machine memory reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSample {
    pub timestamp: DateTime<Local>,
    /// Used memory in bytes
    pub used_mem: u64,
    /// Used memory as a percentage of total
    pub percent: f32,
}

/// Background sampler of host memory.
///
/// Samples are appended on every tick while not paused. Pausing keeps
/// the existing log intact, which is how a charting window is bounded.
pub struct HostSampler {
    interval: Duration,
    samples: Arc<Mutex<Vec<HostSample>>>,
    paused: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HostSampler {
    /// Creates a stopped sampler. Intervals under one second are rejected.
    pub fn new(interval: Duration) -> Result<Self> {
        if interval < MIN_SAMPLE_INTERVAL {
            return Err(Error::InvalidConfig(format!(
                "memory monitor interval cannot be less than {:?} (got {:?})",
                MIN_SAMPLE_INTERVAL, interval
            )));
        }

        Ok(Self {
            interval,
            samples: Arc::new(Mutex::new(Vec::new())),
            paused: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            handle: None,
        })
    }

    /// Starts the sampling thread. Does nothing if already running.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = channel::<()>();
        let samples = Arc::clone(&self.samples);
        let paused = Arc::clone(&self.paused);
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("bear-host-sampler".to_string())
            .spawn(move || {
                let mut system = System::new();
                loop {
                    if !paused.load(Ordering::Relaxed) {
                        let sample = read_host_memory(&mut system);
                        debug!("Host memory: {} bytes ({:.1}%)", sample.used_mem, sample.percent);
                        samples
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(sample);
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
            })?;

        info!("Host memory sampler started (interval: {:?})", interval);
        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);
        Ok(())
    }

    /// Stops appending samples without stopping the thread.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stops the sampling thread and waits for it to exit.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread immediately
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Host memory sampler thread panicked");
            }
            info!("Host memory sampler stopped");
        }
    }

    /// Copy of the sample log.
    pub fn samples(&self) -> Vec<HostSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for HostSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_host_memory(system: &mut System) -> HostSample {
    system.refresh_memory();
    let total = system.total_memory();
    let used = system.used_memory();
    let percent = if total == 0 {
        0.0
    } else {
        used as f32 / total as f32 * 100.0
    };

    HostSample {
        timestamp: Local::now(),
        used_mem: used,
        percent,
    }
}
