//! Configuration module
//!
//! Server settings loaded from a TOML file and overridden from the command line.

mod server;

pub use server::*;
