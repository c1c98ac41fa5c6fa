pub mod config;
pub mod error;
pub mod job;
pub mod local;
pub mod path;
pub mod protocol;
pub mod remote;
pub mod transport;
