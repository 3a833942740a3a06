//! Core traits and leaf types: the error taxonomy, the pluggable codec
//! engines, and the transport seam.

pub mod codec;
pub mod error;
pub mod transport;

pub use codec::{CodecEngine, MinBinCodec, TextCodec, WsMessage};
pub use error::{AckFailure, Result, SocketError};
pub use transport::{CloseReason, Transport, WsTransport};
