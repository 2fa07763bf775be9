// src/progress.rs
//
// Upload progress: the synchronous sink the pipeline reports to, a percentage throttle,
// the push-channel event format, and a terminal progress bar for the CLI.

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::constants::PROGRESS_CAP_BEFORE_COMMIT;
use crate::tree::FileEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub loaded: u64,
    pub total: u64,
    pub percentage: u8,
}

/// Receives progress from the upload pipeline. Called from the upload task; must not block.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: UploadProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(UploadProgress) + Send + Sync,
{
    fn on_progress(&self, progress: UploadProgress) {
        self(progress)
    }
}

/// Discards progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _progress: UploadProgress) {}
}

/// Turns byte counts into percentage events: at most one per whole-percent increase,
/// never decreasing, capped at 99 until `complete` is called.
pub struct ProgressThrottle<'a> {
    sink: &'a dyn ProgressSink,
    total: u64,
    loaded: AtomicU64,
    last_pct: AtomicU8,
}

impl<'a> ProgressThrottle<'a> {
    pub fn new(sink: &'a dyn ProgressSink, total: u64) -> Self {
        Self {
            sink,
            total,
            loaded: AtomicU64::new(0),
            // Nothing reported yet; 0% is still worth one event.
            last_pct: AtomicU8::new(u8::MAX),
        }
    }

    fn percentage(&self, loaded: u64) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = (loaded.min(self.total) as f64 / self.total as f64 * 100.0).round() as u8;
        pct.min(PROGRESS_CAP_BEFORE_COMMIT)
    }

    /// Record `bytes` more bytes handed to the store.
    pub fn advance(&self, bytes: u64) {
        let loaded = self.loaded.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.report(loaded);
    }

    pub fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::SeqCst)
    }

    fn report(&self, loaded: u64) {
        let pct = self.percentage(loaded);
        let prev = self.last_pct.load(Ordering::SeqCst);
        if prev != u8::MAX && pct <= prev {
            return;
        }
        if self
            .last_pct
            .compare_exchange(prev, pct, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.sink.on_progress(UploadProgress {
                loaded: loaded.min(self.total),
                total: self.total,
                percentage: pct,
            });
        }
    }

    /// The store confirmed the write: emit the one and only 100% event.
    pub fn complete(&self) {
        self.last_pct.store(100, Ordering::SeqCst);
        self.sink.on_progress(UploadProgress {
            loaded: self.total,
            total: self.total,
            percentage: 100,
        });
    }
}

/// One message of the upload push channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UploadEvent {
    Progress(UploadProgress),
    Terminal(TerminalEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalEvent {
    Complete { data: FileEntry },
    Error { error: String },
}

impl UploadEvent {
    pub fn complete(data: FileEntry) -> Self {
        UploadEvent::Terminal(TerminalEvent::Complete { data })
    }

    pub fn error(error: impl ToString) -> Self {
        UploadEvent::Terminal(TerminalEvent::Error {
            error: error.to_string(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadEvent::Terminal(_))
    }

    /// Server-sent-events framing: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        let json = serde_json::to_string(self)
            .unwrap_or_else(|e| format!("{{\"type\":\"error\",\"error\":\"{e}\"}}"));
        format!("data: {json}\n\n")
    }
}

/// Forwards progress into an unbounded channel. A closed receiver is ignored.
pub struct ChannelProgressSink {
    tx: UnboundedSender<UploadEvent>,
}

impl ChannelProgressSink {
    pub fn new(tx: UnboundedSender<UploadEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelProgressSink {
    fn on_progress(&self, progress: UploadProgress) {
        let _ = self.tx.send(UploadEvent::Progress(progress));
    }
}

/// Byte-based terminal progress bar.
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    pub fn new(label: &str, total_bytes: u64) -> Self {
        let bar = ProgressBar::new(total_bytes);
        let template = format!(
            "{label}: {{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, ETA: {{eta}})"
        );
        if let Ok(style) = ProgressStyle::default_bar().template(&template) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn finish(&self, label: &str, total_bytes: u64, elapsed: Duration) {
        let mib = total_bytes as f64 / 1_048_576.0;
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        self.bar.finish_with_message(format!(
            "{label} complete: {mib:.2} MiB in {:.2}s ({:.2} MiB/s)",
            elapsed.as_secs_f64(),
            mib / secs
        ));
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

impl ProgressSink for ProgressBarSink {
    fn on_progress(&self, progress: UploadProgress) {
        self.bar.set_position(progress.loaded);
    }
}
