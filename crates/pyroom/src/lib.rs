pub mod cli;
pub mod client;
pub mod commands;

pub use client::{ClientError, PyroomClient};
