pub mod learn;
pub mod ml_model;
pub mod prelude;
pub mod util;
