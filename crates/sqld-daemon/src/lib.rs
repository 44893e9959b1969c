//! HTTP daemon for sqld: flags and configuration, routing, background tasks and
//! telemetry.

pub mod cli;
pub mod middleware {
    pub mod request_log;
}
pub mod server;
pub mod tasks;
pub mod telemetry;
