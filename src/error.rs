use std::io;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors.
///
/// Errors are cheaply cloneable so the loader can memoize the fatal error of
/// a dead worker and re-surface it to consumers on `maybe_throw_error`.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The track transport is none of RTP, MP2T or RAW.
    #[error("transport protocol not supported")]
    UnsupportedProtocol,

    /// No extractor accepted the stream, or required payload metadata was
    /// absent.
    #[error("media format not supported: {0}")]
    UnsupportedFormat(String),

    /// The loadable was released while opening.
    #[error("load canceled")]
    LoadCanceled,

    /// A socket read timed out during steady-state load.
    #[error("read timed out")]
    ReadTimeout,

    /// Any other I/O failure during load.
    #[error("read failed: {0}")]
    ReadFailed(#[source] Arc<io::Error>),

    /// The loader finished before every sample queue published a format.
    #[error("prepare did not complete")]
    PrepareNotComplete,

    /// No usable local UDP port pair could be bound.
    #[error("unable to bind a local UDP port pair")]
    PortBind,

    /// The packet queue or transport was closed underneath a reader.
    #[error("queue closed")]
    QueueClosed,

    /// The input ended while more bytes were required (e.g. inside a peek).
    #[error("unexpected end of input")]
    EndOfInput,

    /// Operation attempted after `release()`.
    #[error("pipeline released")]
    Released,

    /// RTP/RTCP wire data could not be parsed.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::ReadFailed(Arc::new(e))
    }
}

impl From<util::Error> for Error {
    fn from(e: util::Error) -> Self {
        Error::MalformedPacket(e.to_string())
    }
}

impl From<rtcp::Error> for Error {
    fn from(e: rtcp::Error) -> Self {
        Error::MalformedPacket(e.to_string())
    }
}

impl From<rtp::Error> for Error {
    fn from(e: rtp::Error) -> Self {
        Error::MalformedPacket(e.to_string())
    }
}
