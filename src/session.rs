//! Session management for run output.
//!
//! A session is one directory holding a run report and the screenshots of
//! passing pairs:
//! - unique directories under the configured base directory
//! - automatic cleanup unless explicitly preserved
//! - `.session.json` metadata

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config;
use crate::report::RunReport;
use crate::request::PairKey;

const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Error types for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("screenshot is not a PNG data URL")]
    NotPngDataUrl,

    #[error("invalid screenshot encoding: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Output directory for one run
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session ID
    pub id: String,
    /// Root directory for this session
    pub dir: PathBuf,
    /// Whether to keep files after the session ends
    pub keep: bool,
}

impl Session {
    /// Create a new session with a unique ID
    pub fn new() -> Self {
        let id = generate_session_id();
        let dir = base_dir().join(&id);
        Self {
            id,
            dir,
            keep: false,
        }
    }

    /// Create a session with a name prefix
    pub fn with_name(name: &str) -> Self {
        let id = format!("{}_{}", sanitize_name(name), generate_timestamp_suffix());
        let dir = base_dir().join(&id);
        Self {
            id,
            dir,
            keep: false,
        }
    }

    /// Use a caller-chosen directory. Kept by default.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(generate_session_id);
        Self {
            id,
            dir,
            keep: true,
        }
    }

    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Create the directory and write `.session.json`
    pub fn init(&self) -> SessionResult<()> {
        fs::create_dir_all(&self.dir)?;
        let metadata = serde_json::json!({
            "id": self.id,
            "created": chrono::Utc::now().to_rfc3339(),
        });
        fs::write(
            self.dir.join(".session.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;
        Ok(())
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join("report.json")
    }

    /// Path for the screenshot of `pair`
    pub fn screenshot_path(&self, pair: &PairKey) -> PathBuf {
        let filename = format!(
            "{}_{}.png",
            pair.test_index.0,
            sanitize_name(pair.backend.id())
        );
        self.dir.join(filename)
    }

    /// Write the run report as JSON
    pub fn write_report(&self, report: &RunReport) -> SessionResult<PathBuf> {
        let path = self.report_path();
        fs::write(&path, serde_json::to_string_pretty(report)?)?;
        Ok(path)
    }

    /// Decode a PNG data URL and write it for `pair`
    pub fn write_screenshot(&self, pair: &PairKey, data_url: &str) -> SessionResult<PathBuf> {
        let path = self.screenshot_path(pair);
        fs::write(&path, decode_data_url(data_url)?)?;
        Ok(path)
    }

    /// Write every screenshot in `report`, returning the files written
    pub fn write_screenshots(&self, report: &RunReport) -> SessionResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        for pair in &report.pairs {
            if let Some(data_url) = pair.record.as_ref().and_then(|r| r.screenshot.as_deref()) {
                written.push(self.write_screenshot(&pair.pair, data_url)?);
            }
        }
        Ok(written)
    }

    /// List all PNG files in the session
    pub fn list_screenshots(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut screenshots = Vec::new();
        if self.dir.exists() {
            for entry in fs::read_dir(&self.dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "png") {
                    screenshots.push(path);
                }
            }
        }
        screenshots.sort();
        Ok(screenshots)
    }

    pub fn cleanup(&self) -> std::io::Result<()> {
        if self.dir.exists() && !self.keep {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

fn base_dir() -> PathBuf {
    PathBuf::from(config::session_base_dir())
}

/// Decode the bytes of a `data:image/png;base64,` URL
pub fn decode_data_url(data_url: &str) -> SessionResult<Vec<u8>> {
    let encoded = data_url
        .strip_prefix(DATA_URL_PREFIX)
        .ok_or(SessionError::NotPngDataUrl)?;
    Ok(BASE64.decode(encoded)?)
}

fn generate_session_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("session_{}_{}", timestamp, std::process::id())
}

fn generate_timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Sanitize a name for use in filenames
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Remove sessions under the base directory older than `max_age`
pub fn cleanup_old_sessions(max_age: std::time::Duration) -> std::io::Result<usize> {
    let base = base_dir();
    if !base.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut cleaned = 0;
    for entry in fs::read_dir(&base)? {
        let entry = entry?;
        let path = entry.path();
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if path.is_dir() && expired && fs::remove_dir_all(&path).is_ok() {
            cleaned += 1;
        }
    }
    Ok(cleaned)
}

/// Whether `path` looks like a session directory
pub fn is_session_dir(path: &Path) -> bool {
    path.join(".session.json").is_file()
}
