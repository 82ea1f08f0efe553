//! cvdr-protocol: Status report format for cvdr connection agents
//!
//! A connection agent reports the outcome of its negotiation phase as a
//! single JSON line on its standard output. This crate defines that record
//! and the codec used by the launching process to read it.

pub mod codec;
pub mod error;
pub mod status;

pub use codec::{decode_report, encode_report, StatusReportCodec, MAX_REPORT_SIZE};
pub use error::ProtocolError;
pub use status::{ConnectionStatus, ControlState};
