pub mod cache;
pub mod engine;
pub mod forward;
pub mod regime;
pub mod retrieval;
pub mod vector;

pub use engine::{
    match_series, AnalogEngine, CandleSource, JsonFileCandleSource, MatchRequest, MatchResponse,
};
pub use forward::{ForwardStats, Percentiles};
pub use regime::Regime;
pub use retrieval::{retrieve, HistoricalMatch, RetrievalResult};
