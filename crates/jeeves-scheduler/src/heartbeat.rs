use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jeeves_channels::OutboundChannel;

use crate::engine::AgentInvoker;

/// Session key for heartbeat-triggered turns.
pub const HEARTBEAT_SESSION_KEY: &str = "heartbeat";

/// Fixed prompt injected on every actionable tick.
pub const HEARTBEAT_PROMPT: &str = "Read HEARTBEAT.md and follow its instructions. \
If nothing needs attention, reply with exactly HEARTBEAT_OK.";

/// Replies equal to this (after trimming) are suppressed.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// Identical replies within this window (hours) are sent only once.
const DEDUP_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    pub interval: Duration,
    /// Active-hours window, process-local time. `start > end` wraps midnight.
    pub active_start: NaiveTime,
    pub active_end: NaiveTime,
    /// Outbound recipient for alerts. `"heartbeat"` when unset.
    pub channel_id: Option<String>,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            active_start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            active_end: NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
            channel_id: None,
        }
    }
}

impl HeartbeatOptions {
    /// Build from config strings; unparseable `HH:MM` values fall back to
    /// the defaults with a warning.
    pub fn from_config(
        interval_minutes: u64,
        active_start: &str,
        active_end: &str,
        channel_id: Option<String>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            interval: Duration::from_secs(interval_minutes.max(1) * 60),
            active_start: parse_hhmm(active_start).unwrap_or_else(|| {
                warn!(value = active_start, "bad active_start; using default");
                defaults.active_start
            }),
            active_end: parse_hhmm(active_end).unwrap_or_else(|| {
                warn!(value = active_end, "bad active_end; using default");
                defaults.active_end
            }),
            channel_id,
        }
    }
}

struct DedupState {
    last_sent_text: Option<String>,
    last_sent_at: Option<DateTime<Utc>>,
}

/// Periodic ticker that runs the agent against a user-maintained
/// `HEARTBEAT.md` and forwards non-OK replies, deduplicated over 24 h.
///
/// Every failure inside a tick is logged and swallowed: a broken heartbeat
/// must never halt the ticker.
pub struct Heartbeat {
    workspace_dir: PathBuf,
    options: HeartbeatOptions,
    invoker: Arc<dyn AgentInvoker>,
    channel: Arc<dyn OutboundChannel>,
    state: Mutex<DedupState>,
    stop_tx: watch::Sender<bool>,
}

impl Heartbeat {
    pub fn new(
        workspace_dir: impl Into<PathBuf>,
        options: HeartbeatOptions,
        invoker: Arc<dyn AgentInvoker>,
        channel: Arc<dyn OutboundChannel>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            workspace_dir: workspace_dir.into(),
            options,
            invoker,
            channel,
            state: Mutex::new(DedupState {
                last_sent_text: None,
                last_sent_at: None,
            }),
            stop_tx,
        }
    }

    /// Spawn the ticker. The first tick happens one full interval after
    /// start, not immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let hb = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            info!(interval_secs = hb.options.interval.as_secs(), "heartbeat started");
            let mut ticker = tokio::time::interval(hb.options.interval);
            ticker.tick().await; // swallow the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => hb.tick().await,
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("heartbeat stopped");
        })
    }

    /// Stop future ticks immediately.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn tick(&self) {
        self.tick_at(Utc::now(), Local::now().time()).await;
    }

    /// One tick with an injected clock (`now` for dedup bookkeeping,
    /// `local_time` for the active-hours window).
    pub async fn tick_at(&self, now: DateTime<Utc>, local_time: NaiveTime) {
        if !is_active(self.options.active_start, self.options.active_end, local_time) {
            debug!(%local_time, "outside active hours; skipping heartbeat");
            return;
        }

        let path = self.workspace_dir.join("HEARTBEAT.md");
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => {
                debug!("no HEARTBEAT.md; skipping heartbeat");
                return;
            }
        };
        if !has_actionable_content(&content) {
            debug!("HEARTBEAT.md has no actionable content; skipping");
            return;
        }

        let reply = match self
            .invoker
            .invoke(HEARTBEAT_SESSION_KEY, HEARTBEAT_PROMPT)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "heartbeat agent turn failed");
                return;
            }
        };

        let trimmed = reply.trim();
        if trimmed == HEARTBEAT_OK {
            debug!("heartbeat reports OK");
            return;
        }

        {
            let state = self.state.lock().unwrap();
            let duplicate = state.last_sent_text.as_deref() == Some(trimmed)
                && state
                    .last_sent_at
                    .is_some_and(|sent| (now - sent).num_hours() < DEDUP_WINDOW_HOURS);
            if duplicate {
                debug!("suppressing duplicate heartbeat alert");
                return;
            }
        }

        let channel_id = self.options.channel_id.as_deref().unwrap_or("heartbeat");
        if let Err(e) = self.channel.send(channel_id, trimmed).await {
            // Not recorded as sent — the next tick retries.
            warn!(error = %e, "heartbeat send failed");
            return;
        }

        let mut state = self.state.lock().unwrap();
        state.last_sent_text = Some(trimmed.to_string());
        state.last_sent_at = Some(now);
        info!("heartbeat alert sent");
    }
}

/// Active-hours test. `start <= end` is the inclusive window
/// `[start, end]`; otherwise it wraps midnight.
pub fn is_active(start: NaiveTime, end: NaiveTime, t: NaiveTime) -> bool {
    if start <= end {
        t >= start && t <= end
    } else {
        t >= start || t <= end
    }
}

/// Actionable = at least one line that is neither blank nor a `#` comment.
fn has_actionable_content(content: &str) -> bool {
    content
        .lines()
        .any(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}
