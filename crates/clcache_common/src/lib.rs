//! Shared foundation types for the clcache compiler cache.
//!
//! This crate provides the content digest used for all cache keys and the
//! immutable configuration record loaded once from the `CLCACHE_*`
//! environment variables at startup.

#![warn(missing_docs)]

mod config;
mod hash;

pub use config::Config;
pub use hash::{Digest, Hasher, hash_file, hash_str};
