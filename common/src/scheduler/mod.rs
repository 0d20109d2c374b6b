// Scheduler module: the dispatch runner

pub mod engine;

pub use engine::{CycleReport, SchedulerConfig, SchedulerRunner};
