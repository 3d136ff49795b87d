//! Testing helpers for use writing unit and integration tests of the `baler` crate
//!
//! This is internal to `baler` and is not intended for use by any other crates.  Breaking
//! changes can be made at any time.  The only reason this is published at all is that
//! `cargo publish` requires that all `dev-dependencies` be resolvable in the public
//! registry.
pub mod memory;
pub mod tar;
pub mod test_data;

pub use memory::MemoryBucket;

/// Test code that reports errors can just cheat and use `eyre`
pub type Result<T> = color_eyre::Result<T>;
