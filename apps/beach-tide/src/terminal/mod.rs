//! The `beach-tide` command line client.

pub mod app;
pub mod cli;
pub mod error;
