// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Append-only console log with a single rotated backup.

use hyperv_host::backup_path;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

/// A console log file, rotated to `<path>.1` once it would grow past
/// `max_size`.
#[derive(Debug)]
pub struct ConsoleLog {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    max_size: u64,
}

impl ConsoleLog {
    /// Opens (or creates) the log at `path` for appending.
    pub fn open(path: impl Into<PathBuf>, max_size: u64) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            file: Some(file),
            size,
            max_size,
        })
    }

    /// The live log path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `data`, rotating first if it would push the file past the
    /// maximum size.
    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        if self.size > 0 && self.size + data.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let mut file = match self.file.take() {
            Some(file) => file,
            None => {
                // A previous rotation failed after closing the file.
                let file = open_append(&self.path)?;
                self.size = file.metadata()?.len();
                file
            }
        };
        let r = file.write_all(data);
        self.file = Some(file);
        r?;
        self.size += data.len() as u64;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        let backup = backup_path(&self.path);
        tracing::debug!(path = %self.path.display(), "rotating console log");
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        match std::fs::remove_file(&backup) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
            _ => {}
        }
        std::fs::rename(&self.path, &backup)?;
        self.file = Some(open_append(&self.path)?);
        self.size = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn rotates_once_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let backup = backup_path(&path);
        let mut log = ConsoleLog::open(&path, 10).unwrap();

        log.append(b"0123456").unwrap();
        assert!(!backup.exists());

        log.append(b"789a").unwrap();
        assert_eq!(std::fs::read(&backup).unwrap(), b"0123456");
        assert_eq!(std::fs::read(&path).unwrap(), b"789a");

        // Reaching the limit exactly does not rotate.
        log.append(b"bcdefg").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"789abcdefg");
        assert_eq!(std::fs::read(&backup).unwrap(), b"0123456");

        // Only one generation is kept.
        log.append(b"XY").unwrap();
        assert_eq!(std::fs::read(&backup).unwrap(), b"789abcdefg");
        assert_eq!(std::fs::read(&path).unwrap(), b"XY");
    }

    #[test]
    fn resumes_existing_log_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        std::fs::write(&path, b"previous").unwrap();

        let mut log = ConsoleLog::open(&path, 10).unwrap();
        log.append(b"run").unwrap();
        assert_eq!(std::fs::read(backup_path(&path)).unwrap(), b"previous");
        assert_eq!(std::fs::read(&path).unwrap(), b"run");
    }

    #[test]
    fn oversized_chunk_into_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let mut log = ConsoleLog::open(&path, 4).unwrap();
        log.append(b"too long").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"too long");
        assert!(!backup_path(&path).exists());
    }
}
