//! Registration response encoding

use thiserror::Error;

/// The whole response when the dynamic tunnel was established
pub const SUCCESS_MARKER: &[u8] = b"0";

/// Prefix of every failure response, so a failure can never read as the success marker
pub const FAILURE_PREFIX: &str = "!: ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Empty registration response")]
    EmptyResponse,
}

/// Outcome of one registration, as written back to the registrant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationResponse {
    /// Dynamic tunnel now points at the registrant
    Registered,
    /// No dynamic tunnel is active; carries a human-readable reason
    Failed(String),
}

impl RegistrationResponse {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Registered)
    }

    /// Bytes written on the registration connection
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Registered => SUCCESS_MARKER.to_vec(),
            Self::Failed(reason) => format!("{}{}", FAILURE_PREFIX, reason).into_bytes(),
        }
    }

    /// Decode everything the server wrote before closing the connection.
    ///
    /// A trailing line ending after the marker is tolerated, since line-based
    /// clients read the response with `readLine`-style helpers.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.is_empty() {
            return Err(ProtoError::EmptyResponse);
        }

        let trimmed = trim_line_ending(bytes);
        if trimmed == SUCCESS_MARKER {
            return Ok(Self::Registered);
        }

        let text = String::from_utf8_lossy(bytes);
        let reason = text.strip_prefix(FAILURE_PREFIX).unwrap_or(&text);
        Ok(Self::Failed(reason.trim_end().to_string()))
    }
}

fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}
