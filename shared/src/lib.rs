//! Relaytap Shared Library
//!
//! Wire protocol and error types shared by the tunnel client.

pub mod protocol;
pub mod error;

pub use error::{Error, Result};
