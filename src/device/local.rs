//! Local block-device inspection backed by `lsblk` and `udevadm`.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::command::{CommandError, CommandRunner, ProcessCommandRunner};

/// Default `lsblk` executable.
pub const DEFAULT_LSBLK_BIN: &str = "lsblk";
/// Default `udevadm` executable.
pub const DEFAULT_UDEVADM_BIN: &str = "udevadm";
/// Upper bound passed to `udevadm settle`, which otherwise waits up to
/// 120 seconds while holding the calling thread.
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while inspecting local block devices.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeviceError {
    /// Raised when an inspection tool fails.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when a path cannot be checked.
    #[error("failed to inspect {path}: {message}")]
    Io {
        /// Path being inspected.
        path: Utf8PathBuf,
        /// Operating system error text.
        message: String,
    },
}

/// Access to the guest kernel's view of block devices.
pub trait LocalDevices {
    /// Lists the names of top-level block devices (no partitions).
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when the device list cannot be read.
    fn list_block_devices(&self) -> Result<BTreeSet<String>, DeviceError>;

    /// Waits for pending device-node creation events to finish.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when the event queue cannot be settled.
    fn settle(&self) -> Result<(), DeviceError>;

    /// Resolves a kernel device name to the paths the device-naming
    /// subsystem reports for it.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when the lookup fails.
    fn resolve_device_path(&self, name: &str) -> Result<Vec<Utf8PathBuf>, DeviceError>;

    /// Reports whether `path` exists on disk.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Io`] when existence cannot be determined.
    fn path_exists(&self, path: &Utf8Path) -> Result<bool, DeviceError>;
}

/// [`LocalDevices`] implementation that shells out to system tools.
#[derive(Clone, Debug)]
pub struct SystemDevices<R: CommandRunner> {
    runner: R,
    lsblk_bin: String,
    udevadm_bin: String,
    settle_timeout: Duration,
}

impl SystemDevices<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner and the
    /// default tool names.
    #[must_use]
    pub fn with_process_runner() -> Self {
        Self::new(ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SystemDevices<R> {
    /// Creates an inspector using `runner` and the default tool names.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            lsblk_bin: DEFAULT_LSBLK_BIN.to_owned(),
            udevadm_bin: DEFAULT_UDEVADM_BIN.to_owned(),
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }

    /// Overrides the `lsblk` executable.
    #[must_use]
    pub fn with_lsblk_bin(mut self, value: impl Into<String>) -> Self {
        self.lsblk_bin = value.into();
        self
    }

    /// Overrides the `udevadm` executable.
    #[must_use]
    pub fn with_udevadm_bin(mut self, value: impl Into<String>) -> Self {
        self.udevadm_bin = value.into();
        self
    }

    /// Overrides the `udevadm settle` timeout. Sub-second values round up to
    /// one second.
    #[must_use]
    pub const fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    fn args(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }
}

impl<R: CommandRunner> LocalDevices for SystemDevices<R> {
    fn list_block_devices(&self) -> Result<BTreeSet<String>, DeviceError> {
        let args = Self::args(&["--noheadings", "--list", "--nodeps", "--output", "NAME"]);
        let output = self.runner.run_checked(&self.lsblk_bin, &args)?;
        Ok(output.stdout_lines().map(str::to_owned).collect())
    }

    fn settle(&self) -> Result<(), DeviceError> {
        let seconds = self.settle_timeout.as_secs().max(1);
        let timeout = format!("--timeout={seconds}");
        self.runner
            .run_checked(&self.udevadm_bin, &Self::args(&["settle", &timeout]))?;
        Ok(())
    }

    fn resolve_device_path(&self, name: &str) -> Result<Vec<Utf8PathBuf>, DeviceError> {
        let args = Self::args(&["info", "--root", "--query=name", "--name", name]);
        let output = self.runner.run_checked(&self.udevadm_bin, &args)?;
        Ok(output.stdout_lines().map(Utf8PathBuf::from).collect())
    }

    fn path_exists(&self, path: &Utf8Path) -> Result<bool, DeviceError> {
        let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let Some(file_name) = path.file_name() else {
            return Ok(false);
        };

        match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir.try_exists(file_name).map_err(|err| DeviceError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(DeviceError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    #[test]
    fn list_block_devices_parses_lsblk_output() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "sda\nsdb\n\nnvme0n1\n", "");
        let devices = SystemDevices::new(runner.clone());

        let names = devices.list_block_devices().expect("lsblk succeeds");

        let expected: BTreeSet<String> = ["nvme0n1", "sda", "sdb"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, expected);
        let invocation = runner.invocations().pop().expect("lsblk invoked");
        assert_eq!(
            invocation.command_string(),
            "lsblk --noheadings --list --nodeps --output NAME"
        );
    }

    #[test]
    fn resolve_device_path_queries_udev_name() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "/dev/sdf\n", "");
        let devices = SystemDevices::new(runner.clone()).with_udevadm_bin("/sbin/udevadm");

        let paths = devices.resolve_device_path("sdf").expect("udevadm succeeds");

        assert_eq!(paths, vec![Utf8PathBuf::from("/dev/sdf")]);
        let invocation = runner.invocations().pop().expect("udevadm invoked");
        assert_eq!(
            invocation.command_string(),
            "/sbin/udevadm info --root --query=name --name sdf"
        );
    }

    #[test]
    fn settle_surfaces_non_zero_exit() {
        let runner = ScriptedRunner::new();
        runner.push_failure(1);
        let devices = SystemDevices::new(runner);

        let err = devices.settle().expect_err("settle should fail");
        assert!(matches!(
            err,
            DeviceError::Command(CommandError::Failure {
                status: Some(1),
                ..
            })
        ));
    }

    #[test]
    fn settle_passes_bounded_timeout() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let devices =
            SystemDevices::new(runner.clone()).with_settle_timeout(Duration::from_millis(200));

        devices.settle().expect("settle succeeds");

        let invocation = runner.invocations().pop().expect("udevadm invoked");
        assert_eq!(invocation.command_string(), "udevadm settle --timeout=1");
    }

    #[test]
    fn path_exists_reports_missing_paths() {
        let devices = SystemDevices::new(ScriptedRunner::new());
        let exists = devices
            .path_exists(Utf8Path::new("/definitely/not/a/device/sdz"))
            .expect("missing parent is not an error");
        assert!(!exists);
    }
}
