//! `JOB_STATUS:` progress lines: formatting, parsing, and following a live log.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Tag that starts every progress record in the controller log.
pub const STATUS_TAG: &str = "JOB_STATUS:";

/// One progress record for a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    pub unit: String,
    pub stage: String,
    pub found: usize,
    pub expected: usize,
    pub latest: Option<String>,
}

impl StatusLine {
    pub fn percent(&self) -> f64 {
        if self.expected == 0 {
            100.0
        } else {
            self.found as f64 * 100.0 / self.expected as f64
        }
    }

    /// Parse a log line containing a status record, ignoring any prefix
    /// (timestamps, level) written before the tag.
    pub fn parse(line: &str) -> Option<Self> {
        let (_, record) = line.split_once(STATUS_TAG)?;
        let mut tokens = record.split_whitespace();
        let unit = tokens.next()?.strip_prefix("unit_")?.to_string();

        let fields: HashMap<&str, &str> = tokens.filter_map(|t| t.split_once('=')).collect();
        let latest = match fields.get("latest") {
            Some(&"none") | None => None,
            Some(id) => Some(id.to_string()),
        };

        Some(Self {
            unit,
            stage: fields.get("stage")?.to_string(),
            found: fields.get("found")?.parse().ok()?,
            expected: fields.get("expected")?.parse().ok()?,
            latest,
        })
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} unit_{} stage={} found={} expected={} pct={:.1}% latest={}",
            STATUS_TAG,
            self.unit,
            self.stage,
            self.found,
            self.expected,
            self.percent(),
            self.latest.as_deref().unwrap_or("none")
        )
    }
}

/// Keep the last status record per unit.
pub fn parse_status_log(text: &str) -> BTreeMap<String, StatusLine> {
    let mut states = BTreeMap::new();
    for line in text.lines() {
        if let Some(status) = StatusLine::parse(line) {
            states.insert(status.unit.clone(), status);
        }
    }
    states
}

/// Path of the log a controller run named `name` writes.
pub fn log_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{}.log", name))
}

/// Read position in a growing log file.
struct FileState {
    path: PathBuf,
    last_position: u64,
    /// Text after the last newline, held until the line is complete
    pending: String,
}

impl FileState {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_position: 0,
            pending: String::new(),
        }
    }

    /// Read complete lines appended since the last call.
    fn read_new_lines(&mut self) -> Vec<String> {
        let current_size = match std::fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(_) => {
                // Reset position if file was deleted
                self.last_position = 0;
                self.pending.clear();
                return Vec::new();
            }
        };

        // If file was truncated, start over
        if current_size < self.last_position {
            self.last_position = 0;
            self.pending.clear();
        }

        if current_size == self.last_position {
            return Vec::new();
        }

        let mut content = String::new();
        let read = File::open(&self.path).and_then(|mut file| {
            file.seek(SeekFrom::Start(self.last_position))?;
            file.read_to_string(&mut content)
        });
        if let Err(e) = read {
            debug!("read {} failed: {}", self.path.display(), e);
            return Vec::new();
        }
        self.last_position += content.len() as u64;

        self.pending.push_str(&content);
        let mut lines = Vec::new();
        while let Some(idx) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=idx).collect();
            lines.push(line.trim_end().to_string());
        }
        lines
    }
}

/// Streams new status records from a controller log as it grows.
pub struct StatusFollower {
    /// Polling interval for fallback mode
    poll_interval: Duration,
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl StatusFollower {
    pub fn new(poll_interval_secs: f64) -> Self {
        Self {
            poll_interval: Duration::from_secs_f64(poll_interval_secs),
            stop_tx: None,
            thread_handle: None,
        }
    }

    /// Start following `path`; records already in the file are sent first.
    pub fn start(&mut self, path: PathBuf, update_tx: Sender<StatusLine>) {
        self.stop();

        let (stop_tx, stop_rx) = mpsc::channel();
        self.stop_tx = Some(stop_tx);
        let poll_interval = self.poll_interval;

        let handle = thread::spawn(move || {
            Self::follow_loop(path, stop_rx, update_tx, poll_interval);
        });
        self.thread_handle = Some(handle);
    }

    /// Send every status record in `lines`. Returns false once the receiver is gone.
    fn forward(lines: Vec<String>, update_tx: &Sender<StatusLine>) -> bool {
        for line in lines {
            if let Some(status) = StatusLine::parse(&line) {
                if update_tx.send(status).is_err() {
                    return false;
                }
            }
        }
        true
    }

    fn follow_loop(
        path: PathBuf,
        stop_rx: Receiver<()>,
        update_tx: Sender<StatusLine>,
        poll_interval: Duration,
    ) {
        let mut state = FileState::new(path.clone());
        let (notify_tx, notify_rx) = mpsc::channel();

        // Try to set up file watcher; polling still runs without it
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            },
            Config::default(),
        )
        .ok();
        if let (Some(w), Some(parent)) = (watcher.as_mut(), path.parent()) {
            if let Err(e) = w.watch(parent, RecursiveMode::NonRecursive) {
                warn!("Cannot watch {}: {}, polling only", parent.display(), e);
            }
        }

        loop {
            if !Self::forward(state.read_new_lines(), &update_tx) {
                return;
            }

            // Wait for poll interval, waking early on file events
            let check_interval = Duration::from_millis(100);
            let mut elapsed = Duration::ZERO;
            while elapsed < poll_interval {
                if stop_rx.try_recv().is_ok() {
                    return;
                }
                let mut touched = false;
                while let Ok(event) = notify_rx.try_recv() {
                    touched |= event.paths.iter().any(|p| p == &state.path);
                }
                if touched {
                    break;
                }
                thread::sleep(check_interval);
                elapsed += check_interval;
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatusFollower {
    fn drop(&mut self) {
        self.stop();
    }
}
