pub mod config;
pub mod error;
pub mod inference;
pub mod monitor;
pub mod pipeline;
pub mod source;
