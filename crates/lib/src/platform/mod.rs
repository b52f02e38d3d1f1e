//! Host platform helpers: well-known directories and write protection.

pub mod immutable;
pub mod paths;
