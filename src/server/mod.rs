//! HTTP server

mod http;

pub use http::{handle_request, run, AppState};
