pub mod scheduler;
pub mod worker;

pub use scheduler::{JobType, Scheduler, SyncJob};
pub use worker::{JobOutcome, SyncWorker};
