#![warn(rust_2018_idioms)]
#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;

pub mod error;
pub mod extractor;
pub mod format;
pub mod loader;
pub mod packet_queue;
pub mod pipeline;
pub mod rtcp_dispatcher;
pub mod sample_queue;
pub mod session;
pub mod transport;

pub use error::Error;

/// Largest datagram the pipeline reads off a transport in one call.
pub const RECEIVE_MTU: usize = 1500;

/// Sentinel timestamp meaning "no position set".
pub const TIME_UNSET: i64 = i64::MIN + 1;

/// Sentinel returned by position queries once the load has reached the end
/// of the stream.
pub const TIME_END_OF_SOURCE: i64 = i64::MIN;
