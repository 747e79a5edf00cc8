use std::fmt;

use tonic::{Code, Status};

/// Pipeline phase that owns a user callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Map,
    Reduce,
    Scan,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Map => "map",
            Phase::Reduce => "reduce",
            Phase::Scan => "scan",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MrError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("{phase} callback failed: {source:#}")]
    Callback {
        phase: Phase,
        source: anyhow::Error,
    },

    #[error("group for key of {key_len} bytes declares {declared} value bytes but holds {actual}")]
    CollationConsistency {
        key_len: usize,
        declared: u64,
        actual: usize,
    },

    #[error("malformed key/value buffer at offset {offset}: {reason}")]
    MalformedBuffer { offset: usize, reason: &'static str },

    #[error("pair too large: key {key} bytes, value {value} bytes")]
    PairTooLarge { key: usize, value: usize },

    #[error("cannot {op} without {needs}")]
    InvalidState {
        op: &'static str,
        needs: &'static str,
    },

    #[error("process group: {0}")]
    ProcessGroup(String),

    #[error("pipeline aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MrError {
    pub(crate) fn callback(phase: Phase, source: anyhow::Error) -> Self {
        MrError::Callback { phase, source }
    }
}

impl From<Status> for MrError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::Aborted => MrError::Aborted(status.message().to_string()),
            _ => MrError::ProcessGroup(format!("{:?}: {}", status.code(), status.message())),
        }
    }
}

impl From<MrError> for Status {
    fn from(err: MrError) -> Self {
        match err {
            MrError::Aborted(reason) => Status::aborted(reason),
            MrError::ProcessGroup(msg) => Status::failed_precondition(msg),
            e @ MrError::MalformedBuffer { .. } => Status::invalid_argument(e.to_string()),
            e => Status::internal(e.to_string()),
        }
    }
}
