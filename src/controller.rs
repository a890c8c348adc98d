//! Dashboard controller.
//!
//! Owns the camera facade, the event stream subscription, the poll task and
//! the dispatcher thread. Every display mutation runs on the dispatcher, one
//! message at a time in arrival order; enrichment requests run on
//! short-lived worker threads, at most `MAX_ENRICHMENTS_IN_FLIGHT` at once,
//! and report back through the same inbox.
//!
//! Disposal stops the poll task, unsubscribes from the stream and joins the
//! dispatcher. It runs on `dispose()` and again (as a no-op) on drop.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::camera::{CameraControl, StartOutcome};
use crate::error::{ControllerError, ServiceError, UsageError};
use crate::poller::{spawn_poller, PollHandle, SnapshotResult, DEFAULT_POLL_INTERVAL};
use crate::reconcile::{EnrichmentOutcome, EnrichmentTicket, ReconciliationEngine};
use crate::service::{DetectionService, EnrichmentService};
use crate::session::SessionState;
use crate::stream::{spawn_event_stream, EventSource, EventStreamHandle};
use crate::transport::DetectionEvent;
use crate::{CameraIndex, CaptureMode, SignRecord};

/// Upper bound on concurrent enrichment requests.
pub const MAX_ENRICHMENTS_IN_FLIGHT: usize = 4;

#[derive(Clone, Debug)]
pub struct ControllerOptions {
    pub poll_interval: Duration,
    pub initial_mode: CaptureMode,
    pub initial_camera: CameraIndex,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            initial_mode: CaptureMode::default(),
            initial_camera: 0,
        }
    }
}

/// The externally observable output at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplaySnapshot {
    pub revision: u64,
    pub signs: Vec<SignRecord>,
    pub classes: Vec<String>,
}

enum Dispatch {
    Detection(DetectionEvent),
    Enriched {
        seq: u64,
        response: Result<Vec<SignRecord>, ServiceError>,
    },
    Snapshot(SnapshotResult),
    Shutdown,
}

#[derive(Default)]
struct Shared {
    engine: Mutex<ReconciliationEngine>,
    watchers: Mutex<Vec<Sender<DisplaySnapshot>>>,
}

impl Shared {
    fn snapshot(&self) -> DisplaySnapshot {
        let engine = lock(&self.engine);
        DisplaySnapshot {
            revision: engine.revision(),
            signs: engine.display_list(),
            classes: engine.current_classes().to_vec(),
        }
    }

    fn publish(&self, snapshot: &DisplaySnapshot) {
        lock(&self.watchers).retain(|watcher| watcher.send(snapshot.clone()).is_ok());
    }
}

pub struct Controller {
    camera: Mutex<CameraControl>,
    shared: Arc<Shared>,
    inbox: Sender<Dispatch>,
    stream: Mutex<Option<EventStreamHandle>>,
    poller: Mutex<Option<PollHandle>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Controller {
    /// Enumerate cameras, subscribe to `events` and start polling.
    pub fn new(
        detection: Arc<dyn DetectionService>,
        enrichment: Arc<dyn EnrichmentService>,
        events: Box<dyn EventSource>,
        options: ControllerOptions,
    ) -> Result<Self> {
        let session = SessionState::new(options.initial_mode, options.initial_camera);
        let mut camera = CameraControl::new(detection.clone(), session);
        camera.list_cameras();

        let shared = Arc::new(Shared::default());
        let (inbox, rx) = mpsc::channel();
        let dispatcher = {
            let shared = shared.clone();
            let outbox = inbox.clone();
            std::thread::Builder::new()
                .name("roadwatch-dispatch".to_string())
                .spawn(move || run_dispatcher(rx, outbox, enrichment, shared))?
        };

        // From here on, an early return drops the controller, which disposes
        // whatever has already been started.
        let controller = Self {
            camera: Mutex::new(camera),
            shared,
            inbox,
            stream: Mutex::new(None),
            poller: Mutex::new(None),
            dispatcher: Mutex::new(Some(dispatcher)),
            disposed: AtomicBool::new(false),
        };

        let tx = controller.inbox.clone();
        let stream = spawn_event_stream(events, move |event| {
            tx.send(Dispatch::Detection(event)).is_ok()
        })?;
        *lock(&controller.stream) = Some(stream);

        let tx = controller.inbox.clone();
        let poller = spawn_poller(detection, options.poll_interval, move |result| {
            tx.send(Dispatch::Snapshot(result)).is_ok()
        })?;
        *lock(&controller.poller) = Some(poller);

        log::info!("controller ready");
        Ok(controller)
    }

    pub fn session(&self) -> SessionState {
        lock(&self.camera).session()
    }

    /// Camera indices from the last enumeration.
    pub fn available_cameras(&self) -> Vec<CameraIndex> {
        lock(&self.camera).cameras().to_vec()
    }

    /// Enumerate cameras again on request.
    pub fn list_cameras(&self) -> Result<Vec<CameraIndex>, ControllerError> {
        self.ensure_live()?;
        Ok(lock(&self.camera).list_cameras())
    }

    pub fn set_mode(&self, mode: CaptureMode) -> Result<(), ControllerError> {
        self.ensure_live()?;
        Ok(lock(&self.camera).set_mode(mode)?)
    }

    pub fn set_camera(&self, camera: CameraIndex) -> Result<(), ControllerError> {
        self.ensure_live()?;
        Ok(lock(&self.camera).set_camera(camera)?)
    }

    /// Start capture with the current selection.
    pub fn start(&self) -> Result<StartOutcome, ControllerError> {
        self.ensure_live()?;
        Ok(lock(&self.camera).start_selected()?)
    }

    /// Select `mode` and `camera`, then start capture.
    pub fn start_with(
        &self,
        mode: CaptureMode,
        camera: CameraIndex,
    ) -> Result<StartOutcome, ControllerError> {
        self.ensure_live()?;
        lock(&self.camera).start(mode, camera)
    }

    pub fn stop(&self) -> Result<(), ControllerError> {
        self.ensure_live()?;
        Ok(lock(&self.camera).stop()?)
    }

    pub fn display_list(&self) -> Vec<SignRecord> {
        lock(&self.shared.engine).display_list()
    }

    /// Labels of the most recent non-empty classification batch.
    pub fn current_classes(&self) -> Vec<String> {
        lock(&self.shared.engine).current_classes().to_vec()
    }

    pub fn snapshot(&self) -> DisplaySnapshot {
        self.shared.snapshot()
    }

    /// Receive a snapshot now and after every display change.
    pub fn watch(&self) -> Receiver<DisplaySnapshot> {
        let (tx, rx) = mpsc::channel();
        // Holding the watcher list across the snapshot means a concurrent
        // publish is either seen here or delivered to `tx`, never lost.
        let mut watchers = lock(&self.shared.watchers);
        let current = self.shared.snapshot();
        if tx.send(current).is_ok() {
            watchers.push(tx);
        }
        rx
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop polling, unsubscribe and stop the dispatcher. Idempotent.
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut failures = Vec::new();
        if let Some(poller) = lock(&self.poller).take() {
            if let Err(e) = poller.stop() {
                failures.push(e.to_string());
            }
        }
        if let Some(stream) = lock(&self.stream).take() {
            if let Err(e) = stream.stop() {
                failures.push(e.to_string());
            }
        }
        let _ = self.inbox.send(Dispatch::Shutdown);
        if let Some(dispatcher) = lock(&self.dispatcher).take() {
            if dispatcher.join().is_err() {
                failures.push("dispatcher thread panicked".to_string());
            }
        }
        lock(&self.shared.watchers).clear();
        log::info!("controller disposed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("controller disposal incomplete: {}", failures.join("; ")))
        }
    }

    fn ensure_live(&self) -> Result<(), UsageError> {
        if self.is_disposed() {
            return Err(UsageError::Disposed);
        }
        Ok(())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            log::error!("{}", err);
        }
    }
}

fn run_dispatcher(
    inbox: Receiver<Dispatch>,
    outbox: Sender<Dispatch>,
    enrichment: Arc<dyn EnrichmentService>,
    shared: Arc<Shared>,
) {
    let mut published = lock(&shared.engine).revision();
    let mut workers = EnrichmentWorkers::new(enrichment, outbox);
    while let Ok(message) = inbox.recv() {
        match message {
            Dispatch::Shutdown => break,
            Dispatch::Detection(event) => {
                let ticket = lock(&shared.engine).apply_event(event);
                if let Some(ticket) = ticket {
                    workers.submit(ticket);
                }
            }
            Dispatch::Enriched { seq, response } => {
                let outcome = lock(&shared.engine).complete_enrichment(seq, response);
                match outcome {
                    EnrichmentOutcome::Applied { seq, records } => {
                        log::debug!("enrichment #{} applied ({} records)", seq, records);
                    }
                    EnrichmentOutcome::Stale { seq, applied } => {
                        log::debug!(
                            "discarding stale enrichment #{} (already applied #{})",
                            seq,
                            applied
                        );
                    }
                    EnrichmentOutcome::Failed { seq, error } => {
                        log::warn!("enrichment #{} failed: {}", seq, error);
                    }
                }
                workers.finished();
            }
            Dispatch::Snapshot(Ok(signs)) => {
                log::debug!("sign list refreshed ({} records)", signs.len());
                lock(&shared.engine).replace_with_snapshot(signs);
            }
            Dispatch::Snapshot(Err(error)) => {
                log::warn!("sign list refresh failed: {}", error);
            }
        }

        let snapshot = shared.snapshot();
        if snapshot.revision != published {
            published = snapshot.revision;
            shared.publish(&snapshot);
        }
    }
    log::debug!("dispatcher stopped");
}

/// Enrichment requests in flight, capped at `MAX_ENRICHMENTS_IN_FLIGHT`.
///
/// Past the cap only the newest batch is held back; an older held batch is
/// superseded, since its response could never win over the newer one.
/// Requests are never cancelled; a completion that arrives after shutdown is
/// dropped.
struct EnrichmentWorkers {
    service: Arc<dyn EnrichmentService>,
    outbox: Sender<Dispatch>,
    in_flight: usize,
    deferred: Option<EnrichmentTicket>,
}

impl EnrichmentWorkers {
    fn new(service: Arc<dyn EnrichmentService>, outbox: Sender<Dispatch>) -> Self {
        Self {
            service,
            outbox,
            in_flight: 0,
            deferred: None,
        }
    }

    fn submit(&mut self, ticket: EnrichmentTicket) {
        if self.in_flight < MAX_ENRICHMENTS_IN_FLIGHT {
            self.spawn(ticket);
            return;
        }
        log::debug!("enrichment #{} deferred ({} in flight)", ticket.seq, self.in_flight);
        if let Some(superseded) = self.deferred.replace(ticket) {
            log::debug!("enrichment #{} superseded before it was sent", superseded.seq);
        }
    }

    fn finished(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if let Some(ticket) = self.deferred.take() {
            self.spawn(ticket);
        }
    }

    fn spawn(&mut self, ticket: EnrichmentTicket) {
        let service = self.service.clone();
        let outbox = self.outbox.clone();
        let seq = ticket.seq;
        log::debug!("enrichment #{} requested for {:?}", seq, ticket.labels);
        let spawned = std::thread::Builder::new()
            .name(format!("roadwatch-enrich-{}", seq))
            .spawn(move || {
                let response = service.enrich(&ticket.labels);
                let _ = outbox.send(Dispatch::Enriched {
                    seq: ticket.seq,
                    response,
                });
            });
        match spawned {
            Ok(_) => self.in_flight += 1,
            Err(e) => log::error!("could not start enrichment #{}: {}", seq, e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
