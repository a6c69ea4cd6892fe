//! Opaque access keys that carry their owning project id.
//!
//! This crate provides functionality for:
//! - Generating access keys for a project with a cryptographically secure random tail
//! - Decoding any supported key version back to its project id
//!
//! # Key Versions
//!
//! | Version | Layout | Size | Outer encoding |
//! |---------|--------|------|----------------|
//! | v0 | `project_id(8) || random(16)` | 24 | bit-packed base62, 32 to 39 chars |
//! | v1 | `0x01 || project_id(8) || random(17)` | 26 | base64url |
//! | v2 | `0x02 || project_id(8) || random(23)` | 32 | `{prefix}:` + base64url |
//!
//! The project id is stored big-endian. v1 and v2 keys have a fixed textual
//! length and v2 keys carry a separator, so a key is tried newest version
//! first and the first version that decodes it wins.
//!
//! # Example
//!
//! ```rust
//! use access_key::{AccessKeyConfig, generate, project_id};
//!
//! let config = AccessKeyConfig::default();
//! let key = generate(&config, 12345);
//! assert!(key.starts_with("seq:"));
//! assert_eq!(project_id(&key).unwrap(), 12345);
//! ```

mod base62;
mod config;
mod error;
mod parse;
mod token;

pub use config::{AccessKeyConfig, DEFAULT_PREFIX, SEPARATOR};
pub use error::{AccessKeyError, Result};
pub use parse::{decode, project_id};
pub use token::{Version, encode, generate};
