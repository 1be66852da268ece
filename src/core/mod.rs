//! Core building blocks: errors, configuration, shared types and the
//! circuit breaker state machine.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod types;
