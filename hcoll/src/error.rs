use crate::template::TemplateKind;
use crate::types::{DataType, OpKind, Rank};

pub type Result<T> = std::result::Result<T, HcollError>;

#[derive(Debug, thiserror::Error)]
pub enum HcollError {
    // ── parameter errors ───────────────────────────────────────────────
    #[error("invalid parameter for {op}: {reason}")]
    InvalidParam { op: &'static str, reason: String },

    #[error("slice set mismatch: expected {expected} slices, got {actual}")]
    SliceMismatch { expected: usize, actual: usize },

    #[error("stride count {stride} is smaller than element count {count}")]
    InvalidStride { stride: u64, count: u64 },

    #[error("unknown all-to-all mode {0}")]
    UnknownMode(u32),

    #[error("no template registered for {0}")]
    UnregisteredTemplate(TemplateKind),

    #[error("no cost model for operation {0}")]
    NoCostModel(OpKind),

    #[error("template {template}: cannot {action} while {state}")]
    InvalidState {
        template: TemplateKind,
        state: &'static str,
        action: &'static str,
    },

    #[error("unsupported data type: {dtype} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("range {offset}+{len} exceeds buffer of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    // ── resource errors ────────────────────────────────────────────────
    #[error("insufficient auxiliary streams: need {required}, have {available}")]
    InsufficientStreams { required: usize, available: usize },

    #[error("insufficient signal pairs: need {required}, have {available}")]
    InsufficientSignals { required: usize, available: usize },

    #[error("scratch memory too small: need {required} bytes, have {available}")]
    ScratchTooSmall { required: usize, available: usize },

    #[error("required buffer not supplied: {0}")]
    MissingBuffer(&'static str),

    // ── transport errors ───────────────────────────────────────────────
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("link to rank {peer} closed")]
    LinkClosed { peer: Rank },

    #[error("{op} from rank {peer} timed out")]
    Timeout { op: &'static str, peer: Rank },

    #[error("stream {stream} failed: {reason}")]
    StreamFailed { stream: u32, reason: String },

    // ── internal ───────────────────────────────────────────────────────
    #[error("internal error: {0}")]
    Internal(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl HcollError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an `InvalidParam` error.
    pub fn param(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            op,
            reason: reason.into(),
        }
    }

    /// Parameter errors are raised before any transfer is enqueued and are
    /// never worth resubmitting unchanged.
    pub fn is_parameter_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidParam { .. }
                | Self::SliceMismatch { .. }
                | Self::InvalidStride { .. }
                | Self::UnknownMode(_)
                | Self::UnregisteredTemplate(_)
                | Self::NoCostModel(_)
                | Self::InvalidState { .. }
                | Self::UnsupportedDType { .. }
                | Self::BufferSizeMismatch { .. }
                | Self::OutOfBounds { .. }
        )
    }

    /// Resource errors mean the external allocator handed out too little.
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            Self::InsufficientStreams { .. }
                | Self::InsufficientSignals { .. }
                | Self::ScratchTooSmall { .. }
                | Self::MissingBuffer(_)
        )
    }
}
