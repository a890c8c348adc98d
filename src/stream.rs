//! Event stream client.
//!
//! One subscription per controller, independent of capture state: it may be
//! connected before capture starts and stays up across stop/start cycles.
//! Raw messages are validated here and forwarded as typed events in arrival
//! order. Reconnection belongs to the transport; this client only logs it.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::transport::{parse_stream_payload, DetectionEvent};

const CHANNEL_POLL: Duration = Duration::from_millis(50);

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// One raw message body.
    Message(Vec<u8>),
    /// The connection dropped; the transport is reconnecting.
    Disconnected(String),
}

/// An open subscription: the message iterator, plus a closer that can be
/// invoked from another thread to make the iterator end.
pub struct Subscription {
    pub messages: Box<dyn Iterator<Item = StreamItem> + Send>,
    pub close: Box<dyn FnOnce() + Send>,
}

/// A push channel of detection messages.
pub trait EventSource: Send {
    /// Transport name for logging.
    fn name(&self) -> &'static str;

    /// Connect and subscribe.
    fn open(self: Box<Self>) -> Result<Subscription>;
}

// -------------------- In-process source --------------------

/// Event source fed through an mpsc channel.
pub struct ChannelEventSource {
    rx: Receiver<StreamItem>,
}

impl ChannelEventSource {
    pub fn new() -> (Self, Sender<StreamItem>) {
        let (tx, rx) = mpsc::channel();
        (Self { rx }, tx)
    }
}

impl EventSource for ChannelEventSource {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn open(self: Box<Self>) -> Result<Subscription> {
        let closed = Arc::new(AtomicBool::new(false));
        let closer = closed.clone();
        Ok(Subscription {
            messages: Box::new(ChannelMessages { rx: self.rx, closed }),
            close: Box::new(move || closer.store(true, Ordering::SeqCst)),
        })
    }
}

struct ChannelMessages {
    rx: Receiver<StreamItem>,
    closed: Arc<AtomicBool>,
}

impl Iterator for ChannelMessages {
    type Item = StreamItem;

    fn next(&mut self) -> Option<StreamItem> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            match self.rx.recv_timeout(CHANNEL_POLL) {
                Ok(item) => return Some(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

// -------------------- Subscription thread --------------------

/// Handle to the running subscription. Dropping it unsubscribes.
pub struct EventStreamHandle {
    shutdown: Arc<AtomicBool>,
    close: Option<Box<dyn FnOnce() + Send>>,
    join: Option<JoinHandle<()>>,
}

impl EventStreamHandle {
    /// Unsubscribe and wait for the subscription thread to exit.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(close) = self.close.take() {
            close();
        }
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("event stream thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for EventStreamHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("event stream shutdown failed: {}", err);
        }
    }
}

/// Open `source` and forward every parsed event to `deliver` until stopped.
///
/// `deliver` returns false once its receiver is gone, which ends the
/// subscription.
pub fn spawn_event_stream<F>(source: Box<dyn EventSource>, mut deliver: F) -> Result<EventStreamHandle>
where
    F: FnMut(DetectionEvent) -> bool + Send + 'static,
{
    let name = source.name();
    let Subscription { messages, close } = source.open()?;
    log::info!("event stream subscribed ({})", name);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_thread = shutdown.clone();
    let join = std::thread::Builder::new()
        .name("roadwatch-stream".to_string())
        .spawn(move || {
            for item in messages {
                if shutdown_thread.load(Ordering::SeqCst) {
                    break;
                }
                match item {
                    StreamItem::Message(payload) => match parse_stream_payload(&payload) {
                        Ok(events) => {
                            for event in events {
                                if !deliver(event) {
                                    log::debug!("event sink closed; leaving stream");
                                    return;
                                }
                            }
                        }
                        Err(e) => log::warn!("dropping stream message: {}", e),
                    },
                    StreamItem::Disconnected(reason) => {
                        log::warn!("event stream disconnected: {}. Reconnecting...", reason);
                    }
                }
            }
            log::info!("event stream closed");
        })?;

    Ok(EventStreamHandle {
        shutdown,
        close: Some(close),
        join: Some(join),
    })
}
