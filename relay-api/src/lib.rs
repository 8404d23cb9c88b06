pub mod api;
pub mod config;
pub mod events;
pub mod router;
pub mod sink;
