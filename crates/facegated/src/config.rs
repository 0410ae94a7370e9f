use facegate_core::{LocatorParams, VerifyPolicy};
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite member database.
    pub db_path: PathBuf,
    /// Haar cascade XML used for face location.
    pub cascade_path: PathBuf,
    /// Recognizer distance below which a probe is accepted.
    pub match_threshold: f64,
    /// Number of pipeline worker threads.
    pub workers: usize,
    /// Requests buffered ahead of the workers before callers wait.
    pub queue_depth: usize,
    pub min_face_size: u32,
    pub min_neighbors: u32,
    pub scale_factor: f64,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let defaults = LocatorParams::default();
        Self {
            db_path: lookup("FACEGATE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("members.db")),
            cascade_path: lookup("FACEGATE_CASCADE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/usr/share/facegate/haarcascade_frontalface_default.xml")),
            match_threshold: parse_or(&lookup, "FACEGATE_MATCH_THRESHOLD", VerifyPolicy::default().threshold),
            workers: parse_or(&lookup, "FACEGATE_WORKERS", 2usize).max(1),
            queue_depth: parse_or(&lookup, "FACEGATE_QUEUE_DEPTH", 16usize).max(1),
            min_face_size: parse_or(&lookup, "FACEGATE_MIN_FACE_SIZE", defaults.min_size),
            min_neighbors: parse_or(&lookup, "FACEGATE_MIN_NEIGHBORS", defaults.min_neighbors),
            scale_factor: parse_or(&lookup, "FACEGATE_SCALE_FACTOR", defaults.scale_factor),
            session_bus: lookup("FACEGATE_SESSION_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }

    pub fn locator_params(&self) -> LocatorParams {
        LocatorParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: self.min_face_size,
            max_size: None,
        }
    }

    pub fn verify_policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            threshold: self.match_threshold,
        }
    }
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
