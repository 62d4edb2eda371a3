pub mod analog;
pub mod cli;
pub mod clock;
pub mod confidence;
pub mod config;
pub mod consensus;
pub mod error;
pub mod model;
pub mod outcome;
pub mod pipeline;
pub mod shadow;
pub mod sizing;
pub mod store;
pub mod sweep;
