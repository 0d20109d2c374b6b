// Common library for the stream scheduler: runner, licensing and adapters

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod executor;
pub mod licensing;
pub mod lock;
pub mod models;
pub mod retry;
pub mod scheduler;
pub mod telemetry;
