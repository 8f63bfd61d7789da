#![deny(clippy::all)]
#![deny(clippy::pedantic)]

mod endpoint;
mod options;
pub mod packet;
pub mod stream;
mod tftp_server;
// Re-export all public types from tftp_server
pub use crate::tftp_server::*;
mod tftp_proto;
pub use crate::tftp_proto::{Response, ResponseItem, TftpServerProto, Transfer};
