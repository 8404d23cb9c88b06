pub mod event;
pub mod metrics;
pub mod store;
