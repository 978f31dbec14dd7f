//! Minibridge CLI: stdio interposition with policy enforcement.

pub mod aio;
pub mod cli;
pub mod error;
pub mod scan;
