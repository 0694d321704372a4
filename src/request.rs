//! Block-wise CoAP request engine
//!
//! One request at a time: the engine fragments outbound payloads into
//! Block1 chunks, reassembles Block2 responses, and retransmits the
//! in-flight confirmable message on a fixed interval until the retry
//! budget runs out. The step function is pure over (state, now) so the
//! whole exchange is unit-testable without I/O.

use std::time::{Duration, Instant};

use crate::coap::{self, Block, Message, MessageType};
use crate::handler::{Handler, Outbox};
use crate::mup1;

/// Block size used for both request fragmentation and the Block2 hint
const BLOCK_SIZE: u16 = 256;

/// Retransmission policy for confirmable requests
///
/// The device-facing default is a fixed 3 second interval and five
/// retries; there is deliberately no exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub budget: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            budget: 5,
        }
    }
}

/// Extra options attached to a request
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    pub content_format: Option<u16>,
    pub accept: Option<u16>,
}

/// Terminal outcome of a request
///
/// `code` is `None` when the retry budget was exhausted without any
/// response; otherwise it is the (class, detail) the server returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub code: Option<(u8, u8)>,
    pub payload: Vec<u8>,
}

impl ResponseRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.code, Some((2, _)))
    }
}

/// What the step function wants done next
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Send `frame` and wait until `deadline`
    Send { deadline: Instant, frame: Message },
    /// Keep waiting until `deadline`
    Wait { deadline: Instant },
    /// The request reached a terminal state
    Done,
}

/// A single block-wise request and its mutable exchange state
#[derive(Debug)]
pub struct CoapRequest {
    method: u8,
    uri: String,
    payload_tx: Option<Vec<u8>>,
    options: RequestOptions,
    policy: RetryPolicy,
    token: Vec<u8>,

    req_tx: Option<usize>,
    req_tx_ack: Option<usize>,
    res_more: bool,
    res_num: u32,
    res_bs: u16,
    payload_rx: Vec<u8>,
    mid: u16,
    retry: u32,
    deadline: Option<Instant>,
    last_frame: Option<Message>,
    result_code: Option<(u8, u8)>,
    terminal: bool,
}

impl CoapRequest {
    /// Create a request with the default retransmission policy
    ///
    /// # Arguments
    /// * `method` - CoAP method code (see [`crate::coap::method`])
    /// * `uri` - Resource path, optionally with a `?k=v&...` query
    /// * `payload` - Outbound body; fragmented into Block1 chunks when
    ///   longer than the block size
    /// * `options` - Content-format and accept option values
    pub fn new(method: u8, uri: &str, payload: Option<Vec<u8>>, options: RequestOptions) -> Self {
        Self::with_policy(method, uri, payload, options, RetryPolicy::default())
    }

    /// Create a request with an explicit retransmission policy
    ///
    /// # Arguments
    /// * `method` - CoAP method code (see [`crate::coap::method`])
    /// * `uri` - Resource path, optionally with a `?k=v&...` query
    /// * `payload` - Outbound body; fragmented into Block1 chunks when
    ///   longer than the block size
    /// * `options` - Content-format and accept option values
    /// * `policy` - Retransmit interval and retry budget
    pub fn with_policy(
        method: u8,
        uri: &str,
        payload: Option<Vec<u8>>,
        options: RequestOptions,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            payload_tx: payload,
            options,
            policy,
            token: vec![rand::random::<u8>()],
            req_tx: None,
            req_tx_ack: None,
            res_more: false,
            res_num: 0,
            res_bs: BLOCK_SIZE,
            payload_rx: Vec::new(),
            mid: 0,
            retry: 0,
            deadline: None,
            last_frame: None,
            result_code: None,
            terminal: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn deadline(&self) -> Option<Instant> {
        if self.terminal {
            None
        } else {
            self.deadline
        }
    }

    /// Consume the request into its terminal record
    pub fn into_record(self) -> ResponseRecord {
        ResponseRecord {
            code: self.result_code,
            payload: self.payload_rx,
        }
    }

    fn req_tx_done(&self) -> bool {
        match self.req_tx {
            None => false,
            Some(tx) => {
                self.req_tx_ack == Some(tx)
                    && self.payload_tx.as_ref().map_or(true, |p| tx == p.len())
            }
        }
    }

    /// Decide the next action from the current state and clock
    pub fn next_step(&mut self, now: Instant) -> Step {
        if self.terminal {
            return Step::Done;
        }

        // Timer path: retransmit the in-flight frame or give up
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                if self.retry < self.policy.budget {
                    self.retry += 1;
                    let next = now + self.policy.interval;
                    self.deadline = Some(next);
                    log::debug!(
                        "retransmit mid {:#06x} (attempt {}/{})",
                        self.mid,
                        self.retry,
                        self.policy.budget
                    );
                    if let Some(frame) = self.last_frame.clone() {
                        return Step::Send {
                            deadline: next,
                            frame,
                        };
                    }
                }
                log::warn!("request gave up after {} retries", self.retry);
                self.terminal = true;
                return Step::Done;
            }
            return Step::Wait { deadline };
        }

        if !self.req_tx_done() {
            let mut frame = self.base_frame();
            if let Some(payload) = self.payload_tx.clone() {
                let start = self.req_tx_ack.unwrap_or(0);
                let end = payload.len().min(start + usize::from(BLOCK_SIZE));
                frame.payload = payload[start..end].to_vec();
                frame.block1 = Some(Block::new(
                    (start / usize::from(BLOCK_SIZE)) as u32,
                    end < payload.len(),
                    BLOCK_SIZE,
                ));
                frame.content_format = self.options.content_format;
                self.req_tx = Some(end);
            } else {
                self.req_tx = Some(0);
            }
            return self.arm(now, frame);
        }

        if self.res_more {
            let mut frame = self.base_frame();
            frame.block2 = Some(Block::new(self.res_num + 1, false, self.res_bs));
            return self.arm(now, frame);
        }

        self.terminal = true;
        Step::Done
    }

    /// Process an inbound frame; stray message ids are ignored
    pub fn rx_reply(&mut self, frame: &Message) {
        if self.terminal {
            return;
        }
        if frame.message_id != self.mid {
            log::debug!(
                "ignoring reply with stale mid {:#06x} (current {:#06x})",
                frame.message_id,
                self.mid
            );
            return;
        }

        if frame.msg_type == MessageType::Acknowledgement && frame.code_class == 2 {
            self.req_tx_ack = self.req_tx;
        }

        self.payload_rx.extend_from_slice(&frame.payload);
        match frame.block2 {
            Some(b2) if b2.more => {
                self.res_more = true;
                self.res_num = b2.num;
                self.res_bs = b2.size;
            }
            _ => self.res_more = false,
        }

        self.result_code = Some((frame.code_class, frame.code_detail));
        self.deadline = None;

        if frame.is_error() {
            log::debug!("server returned {}", frame.code_string());
            self.terminal = true;
        }
    }

    /// Fresh confirmable request skeleton: new message id, method code,
    /// URI split into path/query options, and the standing Block2 hint
    /// asking the server to fragment even large error responses.
    fn base_frame(&mut self) -> Message {
        self.mid = rand::random::<u16>();
        let (path, query) = split_uri(&self.uri);
        Message {
            msg_type: MessageType::Confirmable,
            code_class: 0,
            code_detail: self.method,
            message_id: self.mid,
            token: self.token.clone(),
            uri_path: path,
            uri_query: query,
            accept: self.options.accept,
            block2: Some(Block::new(0, false, BLOCK_SIZE)),
            ..Message::default()
        }
    }

    fn arm(&mut self, now: Instant, frame: Message) -> Step {
        let deadline = now + self.policy.interval;
        self.deadline = Some(deadline);
        self.last_frame = Some(frame.clone());
        Step::Send { deadline, frame }
    }
}

/// Split a request URI into path segments and re-encoded query items
fn split_uri(uri: &str) -> (Vec<String>, Vec<String>) {
    let (path, query) = match uri.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (uri, None),
    };

    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let items = query
        .map(|q| {
            q.split('&')
                .filter(|s| !s.is_empty())
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => format!("{}={}", form_decode(k), form_decode(v)),
                    None => form_decode(item),
                })
                .collect()
        })
        .unwrap_or_default();

    (segments, items)
}

/// Decode application/x-www-form-urlencoded escapes
fn form_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match u8::from_str_radix(&s[i + 1..i + 3], 16) {
                Ok(v) => {
                    out.push(v);
                    i += 3;
                }
                Err(_) => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ============================================================================
// Handler adapter
// ============================================================================

/// Pipeline handler owning the active request
///
/// Installed under the MUP1 CoAP tag; synchronous callers install a
/// request, poll the driver until [`CoapClient::deadline`] clears, and
/// take the terminal record.
#[derive(Debug, Default)]
pub struct CoapClient {
    active: Option<CoapRequest>,
    finished: Option<ResponseRecord>,
}

impl CoapClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a request and emit its first frame
    ///
    /// # Arguments
    /// * `request` - The request to run; replaces any finished one
    /// * `now` - Current time, used to arm the retransmit deadline
    /// * `out` - Transmit queue the first frame is pushed onto
    pub fn submit(&mut self, request: CoapRequest, now: Instant, out: &mut Outbox) {
        let mut request = request;
        self.drive(&mut request, now, out);
        if request.is_terminal() {
            self.finished = Some(request.into_record());
        } else {
            self.active = Some(request);
        }
    }

    /// Take the terminal record once the request is done
    pub fn take_result(&mut self) -> Option<ResponseRecord> {
        self.finished.take()
    }

    pub fn idle(&self) -> bool {
        self.active.is_none()
    }

    fn drive(&mut self, request: &mut CoapRequest, now: Instant, out: &mut Outbox) {
        if let Step::Send { frame, .. } = request.next_step(now) {
            out.push(mup1::tag::COAP, coap::encode(&frame));
        }
    }
}

impl Handler for CoapClient {
    fn name(&self) -> &'static str {
        "coap"
    }

    fn rx(&mut self, _tag: u8, data: &[u8], now: Instant, out: &mut Outbox) {
        let frame = match coap::decode(data) {
            Ok(frame) => frame,
            Err(err) => {
                // poisoned frame: drop it and keep waiting for a valid one
                log::warn!("discarding unparseable CoAP frame: {}", err);
                return;
            }
        };

        if let Some(mut request) = self.active.take() {
            request.rx_reply(&frame);
            self.drive(&mut request, now, out);
            if request.is_terminal() {
                self.finished = Some(request.into_record());
            } else {
                self.active = Some(request);
            }
        } else {
            log::debug!("CoAP frame with no active request, dropping");
        }
    }

    fn timeout_self(&self) -> Option<Instant> {
        self.active.as_ref().and_then(CoapRequest::deadline)
    }

    fn timeout_work(&mut self, now: Instant, out: &mut Outbox) {
        if let Some(mut request) = self.active.take() {
            self.drive(&mut request, now, out);
            if request.is_terminal() {
                self.finished = Some(request.into_record());
            } else {
                self.active = Some(request);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::method;

    fn now() -> Instant {
        Instant::now()
    }

    fn reply(to: &Message, class: u8, detail: u8, payload: &[u8]) -> Message {
        Message {
            msg_type: MessageType::Acknowledgement,
            code_class: class,
            code_detail: detail,
            message_id: to.message_id,
            token: to.token.clone(),
            payload: payload.to_vec(),
            ..Message::default()
        }
    }

    fn sent(step: Step) -> (Instant, Message) {
        match step {
            Step::Send { deadline, frame } => (deadline, frame),
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_get_flow() {
        let t0 = now();
        let mut req = CoapRequest::new(method::GET, "/c/Bth", None, RequestOptions::default());

        let (deadline, frame) = sent(req.next_step(t0));
        assert_eq!(deadline, t0 + Duration::from_secs(3));
        assert_eq!(frame.code_detail, method::GET);
        assert_eq!(frame.uri_path, vec!["c".to_string(), "Bth".to_string()]);
        assert_eq!(frame.block2, Some(Block::new(0, false, 256)));
        assert!(frame.payload.is_empty());

        req.rx_reply(&reply(&frame, 2, 5, b"data"));
        assert_eq!(req.next_step(t0), Step::Done);
        let record = req.into_record();
        assert_eq!(record.code, Some((2, 5)));
        assert_eq!(record.payload, b"data".to_vec());
    }

    #[test]
    fn test_query_items_are_forwarded() {
        let mut req = CoapRequest::new(
            method::FETCH,
            "/c?d=a%20b&k",
            None,
            RequestOptions::default(),
        );
        let (_, frame) = sent(req.next_step(now()));
        assert_eq!(frame.uri_query, vec!["d=a b".to_string(), "k".to_string()]);
    }

    #[test]
    fn test_payload_of_256_fits_one_block() {
        let t0 = now();
        let mut req = CoapRequest::new(
            method::PUT,
            "/c",
            Some(vec![0xAB; 256]),
            RequestOptions::default(),
        );

        let (_, frame) = sent(req.next_step(t0));
        assert_eq!(frame.payload.len(), 256);
        assert_eq!(frame.block1, Some(Block::new(0, false, 256)));

        req.rx_reply(&reply(&frame, 2, 4, &[]));
        assert_eq!(req.next_step(t0), Step::Done);
    }

    #[test]
    fn test_payload_of_257_takes_two_blocks() {
        let t0 = now();
        let mut req = CoapRequest::new(
            method::PUT,
            "/c",
            Some(vec![0xAB; 257]),
            RequestOptions::default(),
        );

        let (_, first) = sent(req.next_step(t0));
        assert_eq!(first.payload.len(), 256);
        assert_eq!(first.block1, Some(Block::new(0, true, 256)));

        // continue response acknowledges the first chunk
        req.rx_reply(&reply(&first, 2, 31, &[]));

        let (_, second) = sent(req.next_step(t0));
        assert_eq!(second.payload.len(), 1);
        assert_eq!(second.block1, Some(Block::new(1, false, 256)));
        assert_ne!(second.message_id, first.message_id);

        req.rx_reply(&reply(&second, 2, 4, &[]));
        assert_eq!(req.next_step(t0), Step::Done);
        assert!(req.into_record().is_success());
    }

    #[test]
    fn test_block2_response_reassembly() {
        let t0 = now();
        let mut req = CoapRequest::new(method::GET, "/big", None, RequestOptions::default());

        let (_, first) = sent(req.next_step(t0));
        let mut part1 = reply(&first, 2, 5, &[b'x'; 256]);
        part1.block2 = Some(Block::new(0, true, 256));
        req.rx_reply(&part1);

        let (_, next) = sent(req.next_step(t0));
        assert_eq!(next.block2, Some(Block::new(1, false, 256)));

        let mut part2 = reply(&next, 2, 5, b"tail");
        part2.block2 = Some(Block::new(1, false, 256));
        req.rx_reply(&part2);

        assert_eq!(req.next_step(t0), Step::Done);
        let record = req.into_record();
        assert_eq!(record.payload.len(), 260);
        assert!(record.payload.ends_with(b"tail"));
    }

    #[test]
    fn test_retransmit_then_give_up() {
        let t0 = now();
        let mut req = CoapRequest::new(method::GET, "/c", None, RequestOptions::default());

        let (mut deadline, first) = sent(req.next_step(t0));
        for attempt in 1..=5u32 {
            let (next_deadline, again) = sent(req.next_step(deadline));
            // retransmission reuses the exact in-flight frame
            assert_eq!(again, first, "attempt {}", attempt);
            assert_eq!(next_deadline, deadline + Duration::from_secs(3));
            deadline = next_deadline;
        }

        assert_eq!(req.next_step(deadline), Step::Done);
        let record = req.into_record();
        assert_eq!(record.code, None);
        assert!(record.payload.is_empty());
    }

    #[test]
    fn test_wait_before_deadline() {
        let t0 = now();
        let mut req = CoapRequest::new(method::GET, "/c", None, RequestOptions::default());
        let (deadline, _) = sent(req.next_step(t0));
        assert_eq!(
            req.next_step(t0 + Duration::from_millis(1)),
            Step::Wait { deadline }
        );
    }

    #[test]
    fn test_stale_message_id_is_ignored() {
        let t0 = now();
        let mut req = CoapRequest::new(method::GET, "/c", None, RequestOptions::default());
        let (_, frame) = sent(req.next_step(t0));

        let mut stray = reply(&frame, 2, 5, b"stale");
        stray.message_id = frame.message_id.wrapping_add(1);
        req.rx_reply(&stray);

        assert!(!req.is_terminal());
        assert!(matches!(req.next_step(t0), Step::Wait { .. }));

        req.rx_reply(&reply(&frame, 2, 5, b"good"));
        assert_eq!(req.next_step(t0), Step::Done);
        assert_eq!(req.into_record().payload, b"good".to_vec());
    }

    #[test]
    fn test_error_response_terminates_with_code() {
        let t0 = now();
        let mut req = CoapRequest::new(method::GET, "/missing", None, RequestOptions::default());
        let (_, frame) = sent(req.next_step(t0));

        req.rx_reply(&reply(&frame, 4, 4, b"not found"));
        assert!(req.is_terminal());
        let record = req.into_record();
        assert_eq!(record.code, Some((4, 4)));
        assert_eq!(record.payload, b"not found".to_vec());
        assert!(!record.is_success());
    }

    #[test]
    fn test_client_handler_round_trip() {
        let t0 = now();
        let mut client = CoapClient::new();
        let mut out = Outbox::default();

        client.submit(
            CoapRequest::new(method::GET, "/c", None, RequestOptions::default()),
            t0,
            &mut out,
        );
        let frames = out.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, mup1::tag::COAP);
        assert!(client.timeout_self().is_some());

        let request_frame = coap::decode(&frames[0].1).unwrap();
        let response = reply(&request_frame, 2, 5, b"ok");
        client.rx(mup1::tag::COAP, &coap::encode(&response), t0, &mut out);

        assert!(client.idle());
        assert!(client.timeout_self().is_none());
        let record = client.take_result().unwrap();
        assert_eq!(record.payload, b"ok".to_vec());
    }

    #[test]
    fn test_client_drops_garbage_frames() {
        let t0 = now();
        let mut client = CoapClient::new();
        let mut out = Outbox::default();
        client.submit(
            CoapRequest::new(method::GET, "/c", None, RequestOptions::default()),
            t0,
            &mut out,
        );
        out.drain();

        // bad version byte: frame is poisoned, request stays pending
        client.rx(mup1::tag::COAP, &[0x81, 0x45, 0x00, 0x01], t0, &mut out);
        assert!(!client.idle());
        assert!(client.take_result().is_none());
    }
}
