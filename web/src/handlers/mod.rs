//! HTTP request handlers, one module per resource.

pub mod dead_letters;
pub mod health;
pub mod positions;

pub use health::{health_check, readiness_check};
