pub mod candle_model;
pub mod model;
