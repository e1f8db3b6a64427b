//! Data models shared between the storage core and its callers

mod connection;

pub use connection::*;
