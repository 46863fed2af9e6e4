// Library root: re-exports all modules so integration tests and the binary
// share the same public API.

pub mod app;
pub mod cfn;
pub mod client;
pub mod config;
pub mod handlers;
pub mod protocol;
pub mod ws_server;
