//! Bounded activity feed plus the JSON-line operator log.
//!
//! Every task outcome lands here: a fixed-capacity FIFO ring consumed by the
//! control plane, an hourly per-engine histogram for the dashboard chart,
//! and one JSON line on stderr per entry for operators scraping the add-on
//! log.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Write;

use chrono::{DateTime, Local, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

pub const RING_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub ts: DateTime<Utc>,
    pub engine: &'static str,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub bytes: u64,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
}

impl ActivityEntry {
    pub fn new(engine: &'static str, detail: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            ts: Utc::now(),
            engine,
            detail: detail.into(),
            url: None,
            bytes: 0,
            outcome,
            persona: None,
            session_id: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn with_session(mut self, persona: impl Into<String>, session_id: u64) -> Self {
        self.persona = Some(persona.into());
        self.session_id = Some(session_id);
        self
    }
}

struct Inner {
    ring: VecDeque<ActivityEntry>,
    // 24 local-hour buckets of per-engine counts, accumulated since start.
    hourly: [HashMap<&'static str, u64>; 24],
}

/// Single-writer activity ring. Writers funnel through [`ActivityLog::record`];
/// readers get snapshots.
pub struct ActivityLog {
    inner: Mutex<Inner>,
    emit_stderr: bool,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::with_stderr(true)
    }

    pub fn with_stderr(emit_stderr: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(RING_CAPACITY),
                hourly: Default::default(),
            }),
            emit_stderr,
        }
    }

    pub fn record(&self, entry: ActivityEntry) {
        debug!(engine = entry.engine, outcome = ?entry.outcome, detail = %entry.detail, "activity");
        if self.emit_stderr {
            if let Ok(line) = serde_json::to_string(&entry) {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "{line}");
            }
        }
        let hour = Local::now().hour() as usize;
        let mut inner = self.inner.lock();
        *inner.hourly[hour].entry(entry.engine).or_insert(0) += 1;
        if inner.ring.len() == RING_CAPACITY {
            inner.ring.pop_front();
        }
        inner.ring.push_back(entry);
    }

    /// Most recent `count` entries, newest first.
    pub fn tail(&self, count: usize) -> Vec<ActivityEntry> {
        let inner = self.inner.lock();
        inner.ring.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of ring entries matching an outcome.
    pub fn count_outcome(&self, outcome: Outcome) -> usize {
        let inner = self.inner.lock();
        inner.ring.iter().filter(|e| e.outcome == outcome).count()
    }

    /// 24-bucket per-engine histogram for the dashboard chart.
    pub fn hourly_chart(&self) -> HashMap<&'static str, [u64; 24]> {
        let inner = self.inner.lock();
        let mut out: HashMap<&'static str, [u64; 24]> = HashMap::new();
        for (hour, bucket) in inner.hourly.iter().enumerate() {
            for (&engine, &count) in bucket {
                out.entry(engine).or_insert([0; 24])[hour] = count;
            }
        }
        out
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}
