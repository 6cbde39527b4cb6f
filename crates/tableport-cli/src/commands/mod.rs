//! Command implementations.

pub mod append;
pub mod create;
pub mod inspect;
