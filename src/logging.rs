//! Logging Setup
//!
//! Console logging always; an optional append-file layer driven by the
//! `logging` config section. The file is size-rotated once at start-up so a
//! long-lived deployment does not grow it without bound across restarts.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize tracing from the logging configuration. `RUST_LOG` wins over
/// the configured level when set.
pub fn init(config: &LoggingConfig) -> Result<(), std::io::Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    if config.file.is_empty() {
        registry.init();
        return Ok(());
    }

    let path = Path::new(&config.file);
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    rotate_if_needed(path, config.max_bytes, config.backup_count)?;
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    registry
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file)),
        )
        .init();
    Ok(())
}

/// Shift `file` into numbered backups (`file.1` newest) once it exceeds
/// `max_bytes`, dropping anything beyond `backup_count`.
fn rotate_if_needed(path: &Path, max_bytes: u64, backup_count: u32) -> Result<(), std::io::Error> {
    let Ok(meta) = fs::metadata(path) else {
        return Ok(());
    };
    if max_bytes == 0 || meta.len() < max_bytes {
        return Ok(());
    }

    for i in (1..backup_count).rev() {
        let from = numbered(path, i);
        if from.exists() {
            fs::rename(&from, numbered(path, i + 1))?;
        }
    }
    if backup_count > 0 {
        fs::rename(path, numbered(path, 1))?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn numbered(path: &Path, i: u32) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_below_threshold_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("fleet.log");
        fs::write(&log, "short").unwrap();
        rotate_if_needed(&log, 1024, 3).unwrap();
        assert!(log.exists());
        assert!(!numbered(&log, 1).exists());
    }

    #[test]
    fn test_rotate_shifts_backups() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("fleet.log");

        fs::write(&log, "first generation").unwrap();
        rotate_if_needed(&log, 1, 3).unwrap();
        assert!(!log.exists());
        assert_eq!(fs::read_to_string(numbered(&log, 1)).unwrap(), "first generation");

        fs::write(&log, "second generation").unwrap();
        rotate_if_needed(&log, 1, 3).unwrap();
        assert_eq!(fs::read_to_string(numbered(&log, 1)).unwrap(), "second generation");
        assert_eq!(fs::read_to_string(numbered(&log, 2)).unwrap(), "first generation");
    }

    #[test]
    fn test_rotate_respects_backup_count() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("fleet.log");

        for generation in 0..5 {
            fs::write(&log, format!("generation {}", generation)).unwrap();
            rotate_if_needed(&log, 1, 2).unwrap();
        }
        assert!(numbered(&log, 1).exists());
        assert!(numbered(&log, 2).exists());
        assert!(!numbered(&log, 3).exists());
    }

    #[test]
    fn test_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("fleet.log");
        rotate_if_needed(&log, 1, 3).unwrap();
        assert!(!log.exists());
    }
}
