pub mod accounts;
pub mod cache;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod pidfile;
pub mod rate_limiter;
pub mod sql;
pub mod status;
pub mod supervisor;
pub mod sync;
pub mod telegram;

pub use accounts::{Account, AccountStore};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{EngineError, Result};
pub use rate_limiter::RateLimiter;
pub use supervisor::{AccountSupervisor, SupervisorState};
pub use sync::{Scheduler, SyncWorker};
