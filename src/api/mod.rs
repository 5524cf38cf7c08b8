//! Client-facing HTTP surface.

pub mod client_http;
