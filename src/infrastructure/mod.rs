pub mod event_bus;
pub mod execution;
pub mod idempotency;
pub mod network;
pub mod persistence;
