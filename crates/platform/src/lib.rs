//! # Kestrel Platform
//!
//! Core platform types shared by the Kestrel crates.
//!
//! This crate provides:
//! - Unified error types (`KestrelError`, `KestrelResult`)
//! - SSH disconnect reason codes (`DisconnectReason`)
//!
//! # Examples
//!
//! ```
//! use kestrel_platform::{KestrelError, KestrelResult};
//!
//! fn example_function() -> KestrelResult<String> {
//!     Ok("Hello, Kestrel!".to_string())
//! }
//!
//! # fn main() -> KestrelResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Kestrel!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{DisconnectReason, KestrelError, KestrelResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
