use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::mount::ops::fuse_unmount;
use crate::platform::Platform;
use crate::util::command::Shell;

/// Unmounts a temporary FUSE mount when dropped unless released first.
pub struct MountGuard {
    mountpoint: PathBuf,
    shell: Arc<dyn Shell>,
    platform: Arc<dyn Platform>,
    armed: bool,
}

impl MountGuard {
    pub fn new(mountpoint: PathBuf, shell: Arc<dyn Shell>, platform: Arc<dyn Platform>) -> Self {
        Self {
            mountpoint,
            shell,
            platform,
            armed: true,
        }
    }

    /// Unmounts now and reports the result.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        fuse_unmount(self.shell.as_ref(), self.platform.as_ref(), &self.mountpoint)
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = fuse_unmount(self.shell.as_ref(), self.platform.as_ref(), &self.mountpoint) {
            warn!("cleanup: {}", err);
        }
    }
}
