//! Tokio codec for agent status reports
//!
//! The decoder yields the raw bytes of each report line rather than a parsed
//! record, so that a launcher can keep the exact agent output around when the
//! line turns out not to be a valid status.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::status::ConnectionStatus;

/// Maximum size of a single report line
pub const MAX_REPORT_SIZE: usize = 4096;

/// Codec for newline-delimited status reports
#[derive(Debug, Default)]
pub struct StatusReportCodec {
    /// Bytes already scanned for a newline
    scanned: usize,
}

impl StatusReportCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { scanned: 0 }
    }
}

impl Decoder for StatusReportCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.scanned..].iter().position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let end = self.scanned + offset;
                self.scanned = 0;
                let mut line = src.split_to(end + 1);
                line.truncate(end);
                if line.last() == Some(&b'\r') {
                    line.truncate(end - 1);
                }
                Ok(Some(line.freeze()))
            }
            None if src.len() > MAX_REPORT_SIZE => Err(ProtocolError::ReportTooLarge {
                max: MAX_REPORT_SIZE,
                prefix: String::from_utf8_lossy(&src[..MAX_REPORT_SIZE]).into_owned(),
            }),
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.scanned = 0;
        if src.is_empty() {
            return Ok(None);
        }
        // Output without a trailing newline is still handed back for parsing
        Ok(Some(src.split().freeze()))
    }
}

impl Encoder<ConnectionStatus> for StatusReportCodec {
    type Error = ProtocolError;

    fn encode(&mut self, status: ConnectionStatus, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&status)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Encode a status as a single report line, newline included
pub fn encode_report(status: &ConnectionStatus) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = BytesMut::new();
    StatusReportCodec::new().encode(*status, &mut buf)?;
    Ok(buf.to_vec())
}

/// Parse a report line produced by an agent
pub fn decode_report(raw: &[u8]) -> Result<ConnectionStatus, ProtocolError> {
    serde_json::from_slice(raw).map_err(|source| ProtocolError::Malformed {
        raw: String::from_utf8_lossy(raw).into_owned(),
        source,
    })
}
