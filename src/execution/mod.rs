// Candle freshness and order sizing
pub mod candle_buffer;
pub mod executor;

pub use candle_buffer::CandleBuffer;
pub use executor::{
    available_funds, mean_score, Direction, ExecutionAction, ExecutionDecision, Executor,
};
