//! Synthesizing classes and method bodies.

mod builder;
mod generator;

pub use self::builder::*;
pub use self::generator::*;
