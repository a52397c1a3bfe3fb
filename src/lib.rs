//! SimpleBank service: configuration, logging, backend selection and the
//! HTTP API over `simplebank_core::Store`.

pub mod api;
pub mod backend;
pub mod config;
pub mod logging;
