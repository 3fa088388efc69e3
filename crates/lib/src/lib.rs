//! chatbridge core library: platform connections, routing, relay and supervision,
//! used by the `chatbridge` CLI.

pub mod channels;
pub mod config;
pub mod error;
pub mod init;
pub mod relay;
pub mod routing;
pub mod runtime;
pub mod server;
pub mod supervisor;
