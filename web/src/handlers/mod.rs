//! HTTP handlers.

pub mod engagement;
pub mod health;
pub mod ranking;
