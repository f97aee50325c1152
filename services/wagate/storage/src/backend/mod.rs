//! Credential store backend implementations

pub mod file;
pub mod mem;
