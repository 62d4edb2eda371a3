use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no candles for {symbol} ({timeframe})")]
    DataNotFound { symbol: String, timeframe: String },

    #[error("invalid window size {0}: expected one of 30/60/90")]
    InvalidWindowSize(usize),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("research model not found: {0}")]
    ModelNotFound(String),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Structurally invalid requests are rejected; everything else is a data/infra failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidWindowSize(_) | Self::InvalidConfig(_) | Self::InvalidTransition { .. }
        )
    }
}
