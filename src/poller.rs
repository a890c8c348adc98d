//! Polling refresher.
//!
//! Pulls the authoritative sign list immediately and then every interval,
//! whether or not capture is active. The task lives until its handle is
//! stopped or dropped; no fetch result is delivered after that.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::ServiceError;
use crate::service::DetectionService;
use crate::{wait_or_shutdown, SignRecord};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub type SnapshotResult = Result<Vec<SignRecord>, ServiceError>;

/// Cancellation handle for the poll task.
#[derive(Debug)]
pub struct PollHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("poll thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("poll shutdown failed: {}", err);
        }
    }
}

/// Start polling `service` every `interval`, handing each result to
/// `deliver`. Polling ends early if `deliver` returns false.
pub fn spawn_poller<F>(
    service: Arc<dyn DetectionService>,
    interval: Duration,
    mut deliver: F,
) -> Result<PollHandle>
where
    F: FnMut(SnapshotResult) -> bool + Send + 'static,
{
    if interval.is_zero() {
        return Err(anyhow!("poll interval must be greater than zero"));
    }
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_thread = shutdown.clone();
    let join = std::thread::Builder::new()
        .name("roadwatch-poll".to_string())
        .spawn(move || {
            loop {
                if shutdown_thread.load(Ordering::SeqCst) {
                    break;
                }
                let result = service.list_signs();
                if shutdown_thread.load(Ordering::SeqCst) {
                    break;
                }
                if !deliver(result) {
                    log::debug!("snapshot sink closed; stopping poll");
                    break;
                }
                if wait_or_shutdown(interval, &shutdown_thread) {
                    break;
                }
            }
            log::debug!("poll task stopped");
        })?;
    log::info!("polling sign list every {:?}", interval);

    Ok(PollHandle {
        shutdown,
        join: Some(join),
    })
}
