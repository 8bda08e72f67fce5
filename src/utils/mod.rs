//! Process-level helpers.

pub mod bootstrap;
pub mod retry;
