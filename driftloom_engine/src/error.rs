// Engine error type.
//
// Only caller contract violations and I/O failures surface as errors. The
// recoverable conditions (empty possible-note set, unavoidable counterpoint
// collision, an evolution intent aimed at a loop with no metadata) are logged
// and handled in place; silence repair is not an error at all.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A scale name the scale book cannot resolve. Never substituted.
    #[error("unknown scale '{name}'")]
    UnknownScale { name: String },

    #[error("loop {loop_id} is outside the configured maximum of {max} loops")]
    LoopOutOfRange { loop_id: usize, max: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
