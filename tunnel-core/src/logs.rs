//! Log File Manager
//!
//! Every engine owns four log destinations: timestamped input/output files
//! created per session, and per-day "latest" input/output files that mirror
//! the most recent live run. Replay sessions write debug mirrors instead.
//!
//! ```text
//! <root>/<YYYY>/<MM>/<DD>/input_<HHMMSS>.log
//! <root>/<YYYY>/<MM>/<DD>/output_<HHMMSS>.log
//! <root>/<YYYY>/<MM>/<DD>/input.log
//! <root>/<YYYY>/<MM>/<DD>/output.log
//! <root>/<YYYY>/<MM>/<DD>/debug/input_debug_<HHMMSS>.log
//! <root>/<YYYY>/<MM>/<DD>/debug/output_debug_<HHMMSS>.log
//! ```

use chrono::{DateTime, Datelike, Local, TimeZone};
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// File name of the per-day latest input mirror
pub const LATEST_INPUT: &str = "input.log";

/// File name of the per-day latest output mirror
pub const LATEST_OUTPUT: &str = "output.log";

/// Subdirectory of the day directory holding replay mirrors
pub const DEBUG_DIR: &str = "debug";

/// Session timestamp format (fixed-width, so lexicographic order is chronological)
const TIMESTAMP_FORMAT: &str = "%H%M%S";

fn timestamped_input_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^input_(\d{6})\.log$").ok())
        .as_ref()
}

/// Format a session timestamp as `HHMMSS`
pub fn session_timestamp<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Extract `<timestamp>` from a file named `input_<timestamp>.log`
pub fn timestamp_from_file_name(name: &str) -> Option<&str> {
    timestamped_input_pattern()?
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Greatest `input_<timestamp>.log` timestamp in `dir`, if any
pub fn latest_timestamp_in(dir: &Path) -> Option<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Cannot scan for timestamped inputs");
            return None;
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            timestamp_from_file_name(name).map(str::to_string)
        })
        .max()
}

/// Derive the session timestamp used to name replay debug logs.
///
/// `input_<ts>.log` yields `<ts>`; `input.log` yields the greatest timestamp
/// among its sibling `input_<ts>.log` files; anything else (or a latest file
/// with no timestamped siblings) falls back to `now`.
pub fn derive_session_timestamp(source: &Path, now: &DateTime<Local>) -> String {
    let name = source.file_name().and_then(|n| n.to_str()).unwrap_or_default();

    if let Some(ts) = timestamp_from_file_name(name) {
        return ts.to_string();
    }

    if name == LATEST_INPUT {
        let dir = match source.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if let Some(ts) = latest_timestamp_in(dir) {
            return ts;
        }
    }

    session_timestamp(now)
}

/// Resolve `path` if it is a symbolic link; otherwise return it unchanged
pub fn resolve_source(path: &Path) -> PathBuf {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => match std::fs::canonicalize(path) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to resolve symlink");
                path.to_path_buf()
            }
        },
        _ => path.to_path_buf(),
    }
}

/// Per-day directory layout under the simulations root
#[derive(Debug, Clone)]
pub struct LogLayout {
    day_dir: PathBuf,
}

impl LogLayout {
    /// Layout for the day of `now` under `root`
    pub fn new(root: impl AsRef<Path>, now: &DateTime<Local>) -> Self {
        let day_dir = root
            .as_ref()
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()))
            .join(format!("{:02}", now.day()));
        Self { day_dir }
    }

    /// `<root>/<YYYY>/<MM>/<DD>`
    pub fn day_dir(&self) -> &Path {
        &self.day_dir
    }

    /// `<day>/debug`
    pub fn debug_dir(&self) -> PathBuf {
        self.day_dir.join(DEBUG_DIR)
    }

    pub fn input_log(&self, ts: &str) -> PathBuf {
        self.day_dir.join(format!("input_{ts}.log"))
    }

    pub fn output_log(&self, ts: &str) -> PathBuf {
        self.day_dir.join(format!("output_{ts}.log"))
    }

    pub fn latest_input(&self) -> PathBuf {
        self.day_dir.join(LATEST_INPUT)
    }

    pub fn latest_output(&self) -> PathBuf {
        self.day_dir.join(LATEST_OUTPUT)
    }

    pub fn debug_input(&self, ts: &str) -> PathBuf {
        self.debug_dir().join(format!("input_debug_{ts}.log"))
    }

    pub fn debug_output(&self, ts: &str) -> PathBuf {
        self.debug_dir().join(format!("output_debug_{ts}.log"))
    }
}

/// Open `path` for appending, creating it if absent
pub fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Open `path` for appending without blocking the runtime
pub async fn open_append_async(path: &Path) -> io::Result<File> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(file.into_std().await)
}

/// Open `path` for writing, truncating any previous content
pub fn open_truncate(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

/// Recreate `path` empty.
///
/// The old entry is unlinked first so a symlinked latest file is replaced
/// rather than written through.
pub fn recreate(path: &Path) -> io::Result<File> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    open_truncate(path)
}

/// The four log handles owned by one engine
#[derive(Debug, Default)]
pub struct LogFiles {
    input: Option<File>,
    output: Option<File>,
    input_latest: Option<File>,
    output_latest: Option<File>,
}

impl LogFiles {
    /// No destinations; writes are no-ops until files are installed
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session files for a live run.
    ///
    /// Timestamped files are appended to; latest files are recreated empty.
    pub fn open_live(layout: &LogLayout, ts: &str) -> io::Result<Self> {
        std::fs::create_dir_all(layout.day_dir())?;

        Ok(Self {
            input: Some(open_append(&layout.input_log(ts))?),
            output: Some(open_append(&layout.output_log(ts))?),
            input_latest: Some(recreate(&layout.latest_input())?),
            output_latest: Some(recreate(&layout.latest_output())?),
        })
    }

    /// Replace the timestamped input destination, closing the previous one
    pub fn set_input(&mut self, file: File) {
        self.input = Some(file);
    }

    /// Replace the timestamped output destination, closing the previous one
    pub fn set_output(&mut self, file: File) {
        self.output = Some(file);
    }

    /// Append a line to both input destinations
    pub fn write_input(&mut self, line: &str) {
        write_line(self.input.as_mut(), line, "input");
        write_line(self.input_latest.as_mut(), line, "input_latest");
    }

    /// Append a line to both output destinations
    pub fn write_output(&mut self, line: &str) {
        write_line(self.output.as_mut(), line, "output");
        write_line(self.output_latest.as_mut(), line, "output_latest");
    }

    /// Close every handle
    pub fn close(&mut self) {
        self.input = None;
        self.output = None;
        self.input_latest = None;
        self.output_latest = None;
    }
}

// Best effort: a failed write never stops the pipeline.
fn write_line(file: Option<&mut File>, line: &str, role: &'static str) {
    if let Some(file) = file {
        if let Err(e) = writeln!(file, "{line}") {
            warn!(role, error = %e, "Failed to write log line");
        }
    }
}
