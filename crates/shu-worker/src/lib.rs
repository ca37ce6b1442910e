// Shu feed worker
//
// Drives persisted PluginExecution records through the executor. The
// ExecutionRunner handles one record (preflights, execution, output cap,
// one-shot feed params); the FeedScheduler finds due feeds, creates
// PENDING rows, claims them atomically, and applies outcomes.

pub mod bootstrap;
pub mod runner;
pub mod schedule;
pub mod scheduler;

pub use runner::{ExecutionRunner, FeedUpdates, RunOutcome};
pub use scheduler::FeedScheduler;
