//! Upload of dumps to a network share.
//!
//! The share is mounted with the system `mount` utility on a private
//! mount point, the dump is copied and the share is unmounted again.
//! NFS and SMB shares are supported, see [ShareUrl].

mod url;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use derive_more::{Display, Error, From};

pub use url::{Protocol, ShareUrl, ShareUrlError};

use crate::exec::{ExecError, Invocation, Runner};
use crate::util::retention::{self, ActualPeriod};

/// Password fed to `sudo` if none is configured.
pub const DEFAULT_ROOT_PASSWORD: &str = "123456";

#[derive(Debug, Display, Error, From)]
pub enum ShareError {
    /// The file to upload doesn't exist.
    #[display("Source file {} not found", _0.display())]
    SourceMissing(#[error(ignore)] PathBuf),
    /// The backup target isn't a valid share url.
    #[display("Invalid share url: {_0}")]
    #[from]
    Url(ShareUrlError),
    /// The host of the share doesn't answer to ping.
    #[display("Share host {host} is unreachable: {source}")]
    Unreachable { host: String, source: ExecError },
    #[display("Creating mount point {} failed: {source}", path.display())]
    MountPoint { path: PathBuf, source: io::Error },
    #[display("Mounting share failed: {_0}")]
    Mount(ExecError),
    #[display("Copying to {} failed: {source}", path.display())]
    Copy { path: PathBuf, source: io::Error },
}

/// Retention applied on the share after a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retention {
    /// Name of the database whose dumps are pruned.
    pub name: String,
    pub period: ActualPeriod,
    pub now: NaiveDateTime,
}

/// Mounts shares and copies files onto them.
#[derive(Debug, Clone)]
pub struct Uploader<R> {
    runner: R,
    root_password: String,
    work_dir: PathBuf,
    unmount_settle: Duration,
}

impl<R: Runner> Uploader<R> {
    pub fn new(runner: R, root_password: &str, work_dir: &Path, unmount_settle: Duration) -> Self {
        Self {
            runner,
            root_password: root_password.to_string(),
            work_dir: work_dir.to_path_buf(),
            unmount_settle,
        }
    }

    /// Checks that `host` answers to a single ping.
    pub fn ping(&self, host: &str) -> Result<(), ShareError> {
        let invocation = Invocation::new("ping").args(["-c", "1", host]);
        self.runner
            .run_checked(&invocation)
            .map_err(|source| ShareError::Unreachable {
                host: host.to_string(),
                source,
            })?;
        log::debug!(target: "share", "Host {host} is reachable");
        Ok(())
    }

    fn sudo(&self) -> Invocation {
        Invocation::new("sudo")
            .arg("--stdin")
            .stdin(format!("{}\n", self.root_password))
    }

    /// Mounts `url` on a fresh mount point below the work directory.
    ///
    /// The share is unmounted when the returned [Mount] is dropped.
    pub fn mount(&self, url: &ShareUrl) -> Result<Mount<'_, R>, ShareError> {
        let point = self.work_dir.join(format!(
            "mnt-{}-{}",
            std::process::id(),
            Local::now().format("%Y%m%d%H%M%S%f")
        ));
        fs::create_dir_all(&point).map_err(|source| ShareError::MountPoint {
            path: point.clone(),
            source,
        })?;

        let mut invocation = self
            .sudo()
            .args(["mount", "--verbose", "--types"])
            .arg(url.protocol.to_string());
        if let Some(options) = url.mount_options() {
            invocation = invocation.arg("--options").secret_arg(options);
        }
        let invocation = invocation
            .arg(url.mount_source())
            .arg(point.to_string_lossy());

        if let Err(e) = self.runner.run_checked(&invocation) {
            let _ = fs::remove_dir(&point);
            return Err(ShareError::Mount(e));
        }
        log::info!(target: "share", "Mounted {url} on {}", point.display());

        Ok(Mount {
            uploader: self,
            point,
        })
    }

    fn unmount(&self, point: &Path) {
        let invocation = self
            .sudo()
            .args(["umount", "--verbose"])
            .arg(point.to_string_lossy());
        if let Err(e) = self.runner.run_checked(&invocation) {
            log::error!(target: "share", "Unmounting {} failed: {e}", point.display());
            return;
        }
        log::info!(target: "share", "Unmounted {}", point.display());

        if !self.unmount_settle.is_zero() {
            thread::sleep(self.unmount_settle);
        }

        let empty = fs::read_dir(point).is_ok_and(|mut entries| entries.next().is_none());
        if !empty {
            log::warn!(target: "share", "Mount point {} is not empty and was kept", point.display());
            return;
        }
        if let Err(e) = fs::remove_dir(point) {
            log::warn!(target: "share", "Removing mount point {} failed: {e}", point.display());
        }
    }

    /// Copies `file` to the share at `url`.
    ///
    /// Returns the file name on the share. Outdated dumps are removed from
    /// the share afterwards when a [Retention] is given.
    pub fn upload(
        &self,
        url: &str,
        file: &Path,
        retention: Option<&Retention>,
    ) -> Result<PathBuf, ShareError> {
        if !file.is_file() {
            return Err(ShareError::SourceMissing(file.to_path_buf()));
        }
        let url: ShareUrl = url.parse()?;
        self.ping(&url.host)?;

        let mount = self.mount(&url)?;
        let file_name = file.file_name().unwrap_or(file.as_os_str());
        let destination = mount.path().join(file_name);

        if destination.exists() {
            log::info!(target: "share", "Replacing {}", destination.display());
            fs::remove_file(&destination).map_err(|source| ShareError::Copy {
                path: destination.clone(),
                source,
            })?;
        }
        log::info!(target: "share", "Copying {} -> {}", file.display(), destination.display());
        fs::copy(file, &destination).map_err(|source| ShareError::Copy {
            path: destination.clone(),
            source,
        })?;

        if let Some(retention) = retention {
            if let Err(e) = retention::prune(
                mount.path(),
                &retention.name,
                retention.period,
                retention.now,
                &destination,
            ) {
                log::warn!(target: "share", "Removing outdated dumps of {} failed: {e}", retention.name);
            }
        }

        Ok(PathBuf::from(file_name))
    }
}

/// A mounted share, unmounted on drop.
#[derive(Debug)]
pub struct Mount<'a, R: Runner> {
    uploader: &'a Uploader<R>,
    point: PathBuf,
}

impl<R: Runner> Mount<'_, R> {
    pub fn path(&self) -> &Path {
        &self.point
    }
}

impl<R: Runner> Drop for Mount<'_, R> {
    fn drop(&mut self) {
        self.uploader.unmount(&self.point);
    }
}
