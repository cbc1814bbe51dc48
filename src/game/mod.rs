//! Game simulation modules

pub mod authority;
pub mod broadcast;
pub mod combat;
pub mod input;
pub mod physics;
pub mod predictor;
pub mod snapshot;
pub mod world;

pub use authority::{AuthoritativeLoop, LoopHandle};
pub use predictor::ClientPredictor;
