//! Quality-control loop: evaluate, correct, learn

mod controller;
mod score;

pub use controller::{Reflective, ReflectionController};
pub use score::{QualityLevel, ReflectionScore};
