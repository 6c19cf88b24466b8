//! Scoped mounts for remote branches.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{info, warn};

use floe_types::error::{FloeError, Result};

use crate::branch::{Branch, BranchLocation};
use crate::platform::shell::run_command_with_timeout;

const MOUNT_TIMEOUT: Duration = Duration::from_secs(120);

/// Makes a remote `user@host:/path` visible as a local directory.
pub trait Mounter: Send + Sync {
    fn mount(&self, target: &str, mount_point: &Path) -> Result<()>;
    fn unmount(&self, mount_point: &Path) -> Result<()>;
}

/// Read-only sshfs mount, released with `fusermount -u`.
#[derive(Debug, Default)]
pub struct SshfsMounter;

fn run_checked(cmd: &mut Command, what: &str) -> Result<()> {
    let output = run_command_with_timeout(cmd, MOUNT_TIMEOUT)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(FloeError::Other(format!(
            "{what} failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn is_mount_point(path: &Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    let wanted = path.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mp| mp == wanted)
}

impl Mounter for SshfsMounter {
    fn mount(&self, target: &str, mount_point: &Path) -> Result<()> {
        std::fs::create_dir_all(mount_point)?;
        if is_mount_point(mount_point) {
            info!("{} already mounted", mount_point.display());
            return Ok(());
        }
        run_checked(
            Command::new("sshfs")
                .arg(target)
                .arg(mount_point)
                .args(["-o", "ro,reconnect,ServerAliveInterval=15"]),
            &format!("sshfs {target}"),
        )
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        run_checked(
            Command::new("fusermount").arg("-u").arg(mount_point),
            &format!("fusermount -u {}", mount_point.display()),
        )
    }
}

/// Holds a branch mount for the duration of a scan; unmounts on drop.
pub struct MountGuard<'a> {
    mounter: &'a dyn Mounter,
    root: PathBuf,
    mounted: bool,
}

impl<'a> MountGuard<'a> {
    /// Mount the branch if it is remote. Local branches get an inert guard.
    pub fn acquire(mounter: &'a dyn Mounter, branch: &Branch, mount_base: &Path) -> Result<Self> {
        let root = branch.local_root(mount_base);
        let mounted = match &branch.location {
            BranchLocation::Local(_) => false,
            BranchLocation::Remote { target, path, .. } => {
                info!("mounting {}:{} at {}", target, path, root.display());
                mounter.mount(&format!("{target}:{path}"), &root)?;
                true
            }
        };
        Ok(Self {
            mounter,
            root,
            mounted,
        })
    }

    /// Directory to scan.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = self.mounter.unmount(&self.root) {
                warn!("failed to unmount {}: {e}", self.root.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMounter {
        calls: Mutex<Vec<String>>,
    }

    impl Mounter for RecordingMounter {
        fn mount(&self, target: &str, mount_point: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("mount {target} {}", mount_point.display()));
            Ok(())
        }

        fn unmount(&self, mount_point: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("unmount {}", mount_point.display()));
            Ok(())
        }
    }

    #[test]
    fn remote_branch_is_unmounted_on_every_exit() {
        let mounter = RecordingMounter::default();
        let branch = Branch::parse_line("me@nas:/vol/photos").unwrap();
        let result: Result<()> = (|| {
            let guard = MountGuard::acquire(&mounter, &branch, Path::new("/mnt"))?;
            assert_eq!(guard.root(), Path::new("/mnt/nas_photos"));
            Err(FloeError::Interrupted)
        })();
        assert!(result.is_err());
        let calls = mounter.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "mount me@nas:/vol/photos /mnt/nas_photos".to_string(),
                "unmount /mnt/nas_photos".to_string(),
            ]
        );
    }

    #[test]
    fn local_branch_never_mounts() {
        let mounter = RecordingMounter::default();
        let branch = Branch::parse_line("/data/media").unwrap();
        {
            let guard = MountGuard::acquire(&mounter, &branch, Path::new("/mnt")).unwrap();
            assert_eq!(guard.root(), Path::new("/data/media"));
        }
        assert!(mounter.calls.lock().unwrap().is_empty());
    }
}
