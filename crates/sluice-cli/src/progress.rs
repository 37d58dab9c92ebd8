use std::time::Instant;

use sluice_core::progress::UploadProgressEvent;

const THROTTLE_MS: u128 = 250;

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

fn truncate_middle(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3); // room for "..."
    let head = keep / 2;
    let tail = keep - head;
    format!("{}...{}", &s[..head], &s[s.len() - tail..])
}

/// Turns progress events into throttled status lines.
///
/// Significant events (start, pause, resume, completion) always render;
/// byte-level updates are limited to one line per 250 ms.
pub struct UploadStatusTracker {
    last_update: Instant,
}

impl UploadStatusTracker {
    pub fn new() -> Self {
        Self {
            last_update: Instant::now() - std::time::Duration::from_millis(THROTTLE_MS as u64),
        }
    }

    /// Returns Some(status_string) if enough time has elapsed or the event is significant.
    /// Returns None if the update should be skipped (throttled).
    pub fn format(&mut self, event: &UploadProgressEvent) -> Option<String> {
        match event {
            UploadProgressEvent::HashStarted { file } => {
                self.last_update = Instant::now();
                Some(format!("{}: hashing...", truncate_middle(file, 40)))
            }
            UploadProgressEvent::HashProgress { file, percent } => {
                self.throttled(|| format!("{}: hashing {percent}%", truncate_middle(file, 40)))
            }
            UploadProgressEvent::HashFinished { file, hash } => {
                self.last_update = Instant::now();
                Some(format!("{}: hash {hash}", truncate_middle(file, 40)))
            }
            UploadProgressEvent::InstantComplete { file, .. } => {
                self.last_update = Instant::now();
                Some(format!(
                    "{}: already stored, skipping transfer",
                    truncate_middle(file, 40)
                ))
            }
            UploadProgressEvent::ChunkUploaded {
                file,
                uploaded_chunks,
                total_chunks,
                ..
            } => self.throttled(|| {
                format!(
                    "{}: {uploaded_chunks}/{total_chunks} chunks",
                    truncate_middle(file, 40)
                )
            }),
            UploadProgressEvent::StatsUpdated {
                file,
                bytes_uploaded,
                total_bytes,
                percent,
            } => self.throttled(|| {
                format!(
                    "{}: {percent}% ({} / {})",
                    truncate_middle(file, 40),
                    format_bytes(*bytes_uploaded),
                    format_bytes(*total_bytes),
                )
            }),
            UploadProgressEvent::Paused { file } => {
                self.last_update = Instant::now();
                Some(format!("{}: paused", truncate_middle(file, 40)))
            }
            UploadProgressEvent::Resumed {
                file,
                verified_chunks,
            } => {
                self.last_update = Instant::now();
                Some(format!(
                    "{}: resumed ({verified_chunks} chunks verified)",
                    truncate_middle(file, 40)
                ))
            }
            UploadProgressEvent::Completed { file, .. } => {
                self.last_update = Instant::now();
                Some(format!("{}: uploaded", truncate_middle(file, 40)))
            }
        }
    }

    fn throttled(&mut self, make: impl FnOnce() -> String) -> Option<String> {
        let now = Instant::now();
        if now.duration_since(self.last_update).as_millis() < THROTTLE_MS {
            return None;
        }
        self.last_update = now;
        Some(make())
    }
}

impl Default for UploadStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_scales() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }

    #[test]
    fn truncate_middle_keeps_ends() {
        assert_eq!(truncate_middle("short.bin", 40), "short.bin");
        let long = "a-very-long-file-name-that-needs-shortening.bin";
        let cut = truncate_middle(long, 20);
        assert!(cut.len() <= 20);
        assert!(cut.contains("..."));
        assert!(cut.starts_with("a-very"));
        assert!(cut.ends_with(".bin"));
    }

    #[test]
    fn byte_updates_are_throttled() {
        let mut tracker = UploadStatusTracker::new();
        let event = UploadProgressEvent::StatsUpdated {
            file: "x.bin".into(),
            bytes_uploaded: 10,
            total_bytes: 100,
            percent: 10,
        };
        assert!(tracker.format(&event).is_some());
        // Immediately after, the same event class is suppressed.
        assert!(tracker.format(&event).is_none());
    }

    #[test]
    fn significant_events_always_render() {
        let mut tracker = UploadStatusTracker::new();
        let stats = UploadProgressEvent::StatsUpdated {
            file: "x.bin".into(),
            bytes_uploaded: 10,
            total_bytes: 100,
            percent: 10,
        };
        assert!(tracker.format(&stats).is_some());
        let paused = UploadProgressEvent::Paused { file: "x.bin".into() };
        assert!(tracker.format(&paused).is_some(), "pause is never throttled");
    }
}
