//! Platform-specific segment backing.

pub mod linux;

pub use linux::*;
