//! `jeeves-core` — shared data model, configuration, and the agent lock.
//!
//! Everything in this crate is consumed by at least two sibling crates:
//! the [`types::Message`] model is persisted by `jeeves-sessions`, harvested
//! by `jeeves-memory`, and exchanged with the LLM by `jeeves-agent`; the
//! [`lock::AgentLock`] serialises every trigger source (chat, cron,
//! heartbeat) onto a single in-flight turn.

pub mod config;
pub mod error;
pub mod lock;
pub mod types;

pub use config::JeevesConfig;
pub use error::{JeevesError, Result};
pub use lock::AgentLock;
pub use types::{Content, ContentBlock, Message, Role};
