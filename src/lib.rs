//! mup1-coreconf: CORECONF client toolkit for MUP1-framed devices
//!
//! This crate talks to embedded devices that expose a CORECONF (CoAP
//! Management Interface) endpoint over the MUP1 serial framing protocol,
//! converting between human-editable JSON/YAML and the CBOR/SID wire
//! encoding of RFC 9254.
//!
//! # Layers
//!
//! - **MUP1 framing** ([`mup1`]): escaped, checksummed frames over a
//!   serial port or TCP bridge, with console passthrough.
//! - **CoAP** ([`coap`], [`request`]): message codec plus a block-wise
//!   client engine (Block1 fragmentation, Block2 reassembly,
//!   confirmable retransmission).
//! - **Schema-driven conversion** ([`schema`], [`codec`],
//!   [`instance_id`]): JSON to CBOR and back, guided by a resolved YANG
//!   tree with SIDs attached.
//! - **Driver** ([`driver`], [`carrier`], [`handler`]): a
//!   single-threaded poll loop that ties the layers together.
//!
//! # Example
//!
//! ```ignore
//! use mup1_coreconf::carrier::Carrier;
//! use mup1_coreconf::coap::method;
//! use mup1_coreconf::driver::Driver;
//! use mup1_coreconf::request::{CoapRequest, RequestOptions};
//!
//! let carrier = Carrier::open("/dev/ttyACM0")?;
//! let mut driver = Driver::new(carrier);
//! let record = driver.request(CoapRequest::new(
//!     method::GET,
//!     "/c",
//!     None,
//!     RequestOptions::default(),
//! ))?;
//! ```

pub mod carrier;
pub mod coap;
pub mod codec;
pub mod driver;
pub mod error;
pub mod handler;
pub mod instance_id;
pub mod json_schema;
pub mod mup1;
pub mod request;
pub mod schema;
pub mod schema_loader;

pub use codec::{Codec, CodecOptions, ContentFormat};
pub use driver::{Announce, Driver};
pub use error::{Error, Result};
pub use request::{CoapRequest, RequestOptions, ResponseRecord, RetryPolicy};
pub use schema::Schema;
pub use schema_loader::load_schema;
