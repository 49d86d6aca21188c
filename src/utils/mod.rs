//! Utility functions for the proxy server

pub mod http;

pub use http::*;
