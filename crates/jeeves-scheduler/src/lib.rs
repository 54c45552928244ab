//! `jeeves-scheduler` — cron jobs and the heartbeat ticker.
//!
//! # Overview
//!
//! Jobs are persisted as a JSON array (write-temp-then-rename) and driven by
//! a single pending timer armed for the soonest enabled `next_run_at_ms`.
//! Due jobs fire *sequentially* through a registered handler, which runs the
//! agent loop under the process-wide agent lock. The heartbeat is a separate
//! ticker that runs the agent against a user-maintained `HEARTBEAT.md`
//! inside a configurable active-hours window.
//!
//! # Schedule variants
//!
//! | Variant | Behaviour                                                |
//! |---------|----------------------------------------------------------|
//! | `at`    | Single fire at an absolute instant; past instants still fire once |
//! | `every` | Repeat every N milliseconds                              |
//! | `cron`  | Cron expression, optional IANA timezone                  |

pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{AgentInvoker, CronScheduler, JobHandler};
pub use error::{Result, SchedulerError};
pub use heartbeat::{
    Heartbeat, HeartbeatOptions, HEARTBEAT_OK, HEARTBEAT_PROMPT, HEARTBEAT_SESSION_KEY,
};
pub use store::JobStore;
pub use types::{CronJob, JobStatus, Schedule};
