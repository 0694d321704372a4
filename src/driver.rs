//! Poll-loop driver
//!
//! Owns the carrier and the handler tree and provides the only blocking
//! point in the whole pipeline: a bounded wait on "bytes available or
//! deadline reached". Synchronous conveniences (`request`, `ping`) are
//! poll loops over that single primitive, so everything stays on one
//! thread with no locks.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::carrier::Carrier;
use crate::error::Result;
use crate::handler::{min_deadline, Dispatcher, Handler, Outbox};
use crate::mup1::{self, tag, Mup1Event, Mup1Framer};
use crate::request::{CoapClient, CoapRequest, ResponseRecord};

/// Inter-byte timeout for a partially received MUP1 frame
const FRAMER_TIMEOUT: Duration = Duration::from_millis(500);

/// Device announcement carried by `A` frames and ping replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    /// Firmware version string
    pub version: String,
    /// Remaining whitespace-separated fields, typically configuration
    /// checksums
    pub checksums: Vec<String>,
}

impl Announce {
    fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let mut fields = text.split_whitespace().map(str::to_string);
        Announce {
            version: fields.next().unwrap_or_default(),
            checksums: fields.collect(),
        }
    }
}

/// Prints device console bytes that arrive outside MUP1 frames
struct ConsoleSink;

impl Handler for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn rx(&mut self, _tag: u8, data: &[u8], _now: Instant, _out: &mut Outbox) {
        eprint!("{}", String::from_utf8_lossy(data));
    }

    fn timeout_self(&self) -> Option<Instant> {
        None
    }

    fn timeout_work(&mut self, _now: Instant, _out: &mut Outbox) {}
}

/// Logs device trace frames
struct TraceSink;

impl Handler for TraceSink {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn rx(&mut self, _tag: u8, data: &[u8], _now: Instant, _out: &mut Outbox) {
        log::debug!("device trace: {}", String::from_utf8_lossy(data).trim_end());
    }

    fn timeout_self(&self) -> Option<Instant> {
        None
    }

    fn timeout_work(&mut self, _now: Instant, _out: &mut Outbox) {}
}

/// Records announcements and completes pending pings
#[derive(Default)]
struct AnnounceMonitor {
    latest: Option<Announce>,
    /// Deadline for an outstanding ping, cleared on pong
    waiting: Option<Instant>,
    ponged: bool,
}

impl Handler for AnnounceMonitor {
    fn name(&self) -> &'static str {
        "announce"
    }

    fn rx(&mut self, tag: u8, data: &[u8], _now: Instant, _out: &mut Outbox) {
        let announce = Announce::parse(data);
        log::info!("device announce: {}", announce.version);
        self.latest = Some(announce);
        if tag == mup1::tag::PING {
            self.waiting = None;
            self.ponged = true;
        }
    }

    fn timeout_self(&self) -> Option<Instant> {
        self.waiting
    }

    fn timeout_work(&mut self, _now: Instant, _out: &mut Outbox) {
        log::warn!("ping timed out");
        self.waiting = None;
    }
}

/// Single-threaded driver over one carrier
pub struct Driver {
    carrier: Carrier,
    framer: Mup1Framer,
    dispatcher: Dispatcher,
    coap: Rc<RefCell<CoapClient>>,
    announce: Rc<RefCell<AnnounceMonitor>>,
    last_rx: Instant,
}

impl Driver {
    pub fn new(carrier: Carrier) -> Self {
        Self::with_framer(carrier, Mup1Framer::new())
    }

    /// Driver with MUP1 framing disabled: every byte is console output
    pub fn without_framing(carrier: Carrier) -> Self {
        Self::with_framer(carrier, Mup1Framer::disabled())
    }

    fn with_framer(carrier: Carrier, framer: Mup1Framer) -> Self {
        let coap = Rc::new(RefCell::new(CoapClient::new()));
        let announce = Rc::new(RefCell::new(AnnounceMonitor::default()));

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(tag::COAP, coap.clone());
        dispatcher.register(tag::ANNOUNCE, announce.clone());
        dispatcher.register(tag::PING, announce.clone());
        dispatcher.register(tag::TRACE, Rc::new(RefCell::new(TraceSink)));
        dispatcher.register(tag::NON_MUP1, Rc::new(RefCell::new(ConsoleSink)));

        Self {
            carrier,
            framer,
            dispatcher,
            coap,
            announce,
            last_rx: Instant::now(),
        }
    }

    /// Latest device announcement seen on this link
    pub fn latest_announce(&self) -> Option<Announce> {
        self.announce.borrow().latest.clone()
    }

    /// One iteration of the poll loop: wait for bytes or the earliest
    /// deadline, feed the framer, dispatch, run expired deadline work,
    /// transmit whatever the handlers queued.
    pub fn poll(&mut self) -> Result<()> {
        let now = Instant::now();
        let mut deadline = self.dispatcher.timeout_next();
        if self.framer.mid_frame() {
            deadline = min_deadline(deadline, Some(self.last_rx + FRAMER_TIMEOUT));
        }
        let timeout = deadline.map(|d| d.saturating_duration_since(now));

        let mut buf = [0u8; 512];
        let n = self.carrier.read_timeout(&mut buf, timeout)?;

        let now = Instant::now();
        let mut out = Outbox::default();
        if n > 0 {
            self.last_rx = now;
            for event in self.framer.feed(&buf[..n]) {
                self.handle_event(event, now, &mut out);
            }
        } else if self.framer.mid_frame() && now >= self.last_rx + FRAMER_TIMEOUT {
            if let Some(event) = self.framer.on_timeout() {
                self.handle_event(event, now, &mut out);
            }
        }

        self.dispatcher.run_expired(now, &mut out);
        self.flush(&mut out)
    }

    /// Synchronous request: installs it on the CoAP handler and polls
    /// until a terminal record exists
    pub fn request(&mut self, request: CoapRequest) -> Result<ResponseRecord> {
        let mut out = Outbox::default();
        self.coap
            .borrow_mut()
            .submit(request, Instant::now(), &mut out);
        self.flush(&mut out)?;

        loop {
            if let Some(record) = self.coap.borrow_mut().take_result() {
                return Ok(record);
            }
            self.poll()?;
        }
    }

    /// MUP1 ping; returns the device announcement from the pong, or
    /// `None` when the device stayed silent
    pub fn ping(&mut self, timeout: Duration) -> Result<Option<Announce>> {
        {
            let mut monitor = self.announce.borrow_mut();
            monitor.waiting = Some(Instant::now() + timeout);
            monitor.ponged = false;
        }

        let mut out = Outbox::default();
        out.push(tag::PING_REQ, Vec::new());
        self.flush(&mut out)?;

        loop {
            {
                let monitor = self.announce.borrow();
                if monitor.ponged {
                    return Ok(monitor.latest.clone());
                }
                if monitor.waiting.is_none() {
                    return Ok(None);
                }
            }
            self.poll()?;
        }
    }

    fn handle_event(&mut self, event: Mup1Event, now: Instant, out: &mut Outbox) {
        match event {
            Mup1Event::Frame { typ, payload } => {
                self.dispatcher.dispatch(typ, &payload, now, out);
            }
            Mup1Event::Passthrough(bytes) => {
                self.dispatcher.dispatch(tag::NON_MUP1, &bytes, now, out);
            }
        }
    }

    fn flush(&mut self, out: &mut Outbox) -> Result<()> {
        for (typ, payload) in out.drain() {
            let frame = mup1::encode_frame(typ, &payload)?;
            self.carrier.write_all(&frame)?;
        }
        Ok(())
    }
}
