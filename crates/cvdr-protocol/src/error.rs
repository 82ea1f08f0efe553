//! Protocol error types

use thiserror::Error;

/// Errors that can occur while reading or writing status reports
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The report line was not a valid status record
    #[error("Malformed status report {raw:?}: {source}")]
    Malformed {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    /// The agent wrote more than a report line can hold without a newline
    #[error("Status report too large: more than {max} bytes without a newline")]
    ReportTooLarge {
        max: usize,
        /// The first `max` bytes of the line
        prefix: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Split an error about unusable agent output into that output and the
    /// parse failure; other errors are handed back unchanged
    pub fn into_malformed(self) -> Result<(String, serde_json::Error), ProtocolError> {
        match self {
            ProtocolError::Malformed { raw, source } => Ok((raw, source)),
            ProtocolError::ReportTooLarge { max, prefix } => {
                let source = <serde_json::Error as serde::de::Error>::custom(format!(
                    "no newline within {} bytes",
                    max
                ));
                Ok((prefix, source))
            }
            other => Err(other),
        }
    }
}
