//! Handler pipeline
//!
//! Received units are dispatched by a one-byte tag to subscribed
//! handlers; each handler owns an absolute deadline and the pipeline
//! aggregates the earliest one so the driver knows how long its single
//! blocking read may last. Everything runs on one logical thread: no
//! handler method blocks, and handlers queue outbound frames on an
//! [`Outbox`] instead of writing to the carrier themselves.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

/// Frames queued for transmission during `rx`/`timeout_work`
#[derive(Debug, Default)]
pub struct Outbox {
    frames: Vec<(u8, Vec<u8>)>,
}

impl Outbox {
    pub fn push(&mut self, tag: u8, payload: Vec<u8>) {
        self.frames.push((tag, payload));
    }

    pub fn drain(&mut self) -> Vec<(u8, Vec<u8>)> {
        std::mem::take(&mut self.frames)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// A participant in the pipeline
pub trait Handler {
    fn name(&self) -> &'static str;

    /// Deliver a reassembled unit for a tag this handler subscribed to
    fn rx(&mut self, tag: u8, data: &[u8], now: Instant, out: &mut Outbox);

    /// The absolute time at which `timeout_work` must run, if any
    fn timeout_self(&self) -> Option<Instant>;

    /// Deadline work; invoked by the pipeline once `timeout_self` elapsed
    fn timeout_work(&mut self, now: Instant, out: &mut Outbox);
}

/// Shared handle to a handler; the pipeline is single-threaded so plain
/// reference counting is enough
pub type SharedHandler = Rc<RefCell<dyn Handler>>;

/// Earlier of two optional deadlines
pub fn min_deadline(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Subscriber table for one dispatch layer
///
/// Multiple handlers may subscribe to the same tag and all of them see
/// the unit. A tag nobody subscribed to is logged once and then
/// suppressed.
#[derive(Default)]
pub struct Dispatcher {
    subscribers: Vec<(u8, SharedHandler)>,
    unsubscribed_seen: Vec<u8>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a handler under a tag
    pub fn register(&mut self, tag: u8, handler: SharedHandler) {
        self.subscribers.push((tag, handler));
    }

    /// Invoke `rx` on every subscriber of `tag`
    pub fn dispatch(&mut self, tag: u8, data: &[u8], now: Instant, out: &mut Outbox) {
        let mut delivered = false;
        for (t, handler) in &self.subscribers {
            if *t == tag {
                handler.borrow_mut().rx(tag, data, now, out);
                delivered = true;
            }
        }
        if !delivered && !self.unsubscribed_seen.contains(&tag) {
            log::warn!("no subscriber for tag {:#04x} ({} bytes)", tag, data.len());
            self.unsubscribed_seen.push(tag);
        }
    }

    /// Minimum deadline across all subscribers
    pub fn timeout_next(&self) -> Option<Instant> {
        self.subscribers
            .iter()
            .fold(None, |acc, (_, h)| min_deadline(acc, h.borrow().timeout_self()))
    }

    /// Run `timeout_work` on every subscriber whose deadline elapsed
    pub fn run_expired(&mut self, now: Instant, out: &mut Outbox) {
        for (_, handler) in &self.subscribers {
            let expired = handler
                .borrow()
                .timeout_self()
                .map_or(false, |deadline| now >= deadline);
            if expired {
                handler.borrow_mut().timeout_work(now, out);
            }
        }
    }
}
