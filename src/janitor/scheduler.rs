//! Scheduler thread running the janitor at a fixed interval.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use super::Janitor;
use crate::metrics;

/// Stops the scheduler. Cheap to clone into signal handlers.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    tx: Sender<()>,
}

impl ShutdownSignal {
    /// Aborts the current run between stages and wakes the sleeping loop.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.tx.try_send(());
    }
}

struct Scheduler {
    janitor: Arc<Janitor>,
    interval: Duration,
    metrics_file: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    shutdown_rx: Receiver<()>,
}

impl Scheduler {
    fn run(self) {
        log::info!(
            "janitor: scheduler started, running every {}",
            humantime::format_duration(self.interval)
        );

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            self.janitor.run(&self.shutdown);
            self.write_metrics();

            match self.shutdown_rx.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("janitor: scheduler shutting down");
    }

    fn write_metrics(&self) {
        let Some(path) = &self.metrics_file else {
            return;
        };
        if let Err(err) = metrics::write_text_file(path) {
            log::warn!(
                "janitor: failed to write metrics to {}: {}",
                path.display(),
                err
            );
        }
    }
}

/// Handle for managing the scheduler thread.
pub struct SchedulerHandle {
    thread: Option<JoinHandle<()>>,
    signal: ShutdownSignal,
}

impl SchedulerHandle {
    /// Spawn the scheduler thread. The first run starts immediately.
    pub fn spawn(
        janitor: Arc<Janitor>,
        interval: Duration,
        metrics_file: Option<PathBuf>,
    ) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(1);
        let scheduler = Scheduler {
            janitor,
            interval,
            metrics_file,
            shutdown: shutdown.clone(),
            shutdown_rx: rx,
        };

        let thread = thread::Builder::new()
            .name("git-janitor".to_string())
            .spawn(move || scheduler.run())?;

        Ok(Self {
            thread: Some(thread),
            signal: ShutdownSignal { flag: shutdown, tx },
        })
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Blocks until the scheduler exits after a shutdown signal.
    pub fn wait(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Signal shutdown and wait for thread to exit.
    pub fn shutdown(&mut self) {
        self.signal.trigger();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
