//! Built-in backend engines

pub mod custom;
pub mod scoring;
pub mod triton;

pub use custom::CustomEngine;
pub use scoring::ScoringEngine;
pub use triton::TritonEngine;
