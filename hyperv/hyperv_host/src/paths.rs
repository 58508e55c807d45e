// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;
use std::path::Path;
use std::path::PathBuf;

const CONSOLE_LOG_FILE_NAME: &str = "console.log";

/// Resolution of per-instance filesystem locations.
pub trait InstancePaths: Send + Sync {
    /// Returns the instance's directory.
    fn instance_dir(&self, instance: &str) -> PathBuf;

    /// Returns the instance's console log files, newest first.
    ///
    /// The first entry is the live file that console output is appended to.
    fn console_log_paths(&self, instance: &str) -> Vec<PathBuf>;

    /// Returns whether the instance directory exists, which is how instances
    /// provisioned by this system are told apart from foreign VMs.
    fn instance_dir_exists(&self, instance: &str) -> bool {
        self.instance_dir(instance).is_dir()
    }

    /// Deletes all console log files of the instance.
    fn delete_console_logs(&self, instance: &str) -> io::Result<()> {
        for path in self.console_log_paths(instance) {
            remove_if_present(&path)?;
        }
        Ok(())
    }
}

/// Instance directories under a common root, with console logs named
/// `console.log` and `console.log.1`.
#[derive(Debug, Clone)]
pub struct InstanceDirLayout {
    root: PathBuf,
}

impl InstanceDirLayout {
    /// Creates a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory holding all instance directories.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl InstancePaths for InstanceDirLayout {
    fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }

    fn console_log_paths(&self, instance: &str) -> Vec<PathBuf> {
        let live = self.instance_dir(instance).join(CONSOLE_LOG_FILE_NAME);
        let backup = backup_path(&live);
        vec![live, backup]
    }
}

/// Returns `path` with `.1` appended, the name of its single rotated backup.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".1");
    backup.into()
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        r => r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn console_logs_are_newest_first() {
        let layout = InstanceDirLayout::new("/instances");
        let paths = layout.console_log_paths("vm1");
        assert_eq!(
            paths,
            [
                PathBuf::from("/instances/vm1/console.log"),
                PathBuf::from("/instances/vm1/console.log.1"),
            ]
        );
    }

    #[test]
    fn delete_console_logs_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstanceDirLayout::new(dir.path());
        std::fs::create_dir(layout.instance_dir("vm1")).unwrap();
        let live = &layout.console_log_paths("vm1")[0];
        std::fs::write(live, b"boot").unwrap();

        layout.delete_console_logs("vm1").unwrap();
        assert!(!live.exists());
        layout.delete_console_logs("vm1").unwrap();
    }

    #[test]
    fn instance_dir_existence() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstanceDirLayout::new(dir.path());
        std::fs::create_dir(layout.instance_dir("ours")).unwrap();
        assert!(layout.instance_dir_exists("ours"));
        assert!(!layout.instance_dir_exists("foreign"));
    }
}
