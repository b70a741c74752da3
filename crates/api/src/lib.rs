//! HTTP API: webhook intake, operational endpoints and process wiring.

pub mod app;
pub mod handler;
pub mod middleware;
