//! Infrastructure layer: sockets and the configuration file.

pub mod network;
pub mod storage;
