//! Shared error taxonomy for every component.
//!
//! Mirrors the recovery policy of the pipeline: transient I/O is retried in
//! place, protocol gaps drive a resync, precision mismatches drive a bounded
//! decimal fallback, guard blocks and malformed input are logged and
//! acknowledged, and terminal errors stop the owning component without
//! touching its peers.

use std::fmt;

#[derive(Debug, Clone)]
pub enum PipelineError {
    TransientIo(String),
    ProtocolGap(String),
    PrecisionMismatch(String),
    GuardBlock(String),
    MalformedInput(String),
    Terminal(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::TransientIo(s) => write!(f, "transient I/O error: {}", s),
            PipelineError::ProtocolGap(s) => write!(f, "protocol gap: {}", s),
            PipelineError::PrecisionMismatch(s) => write!(f, "precision mismatch: {}", s),
            PipelineError::GuardBlock(s) => write!(f, "guard block: {}", s),
            PipelineError::MalformedInput(s) => write!(f, "malformed input: {}", s),
            PipelineError::Terminal(s) => write!(f, "terminal error: {}", s),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<redis::RedisError> for PipelineError {
    fn from(e: redis::RedisError) -> Self {
        PipelineError::TransientIo(e.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::TransientIo(e.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::TransientIo(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_variant_context() {
        let e = PipelineError::GuardBlock("global cap exceeded".into());
        assert_eq!(e.to_string(), "guard block: global cap exceeded");
    }
}
