//! Daemon lifecycle: bring up the connection pool, mount the filesystem,
//! wait for a termination signal, tear everything down.

use crate::app_config;
use tracing::{debug, error, info};

mod managed_fuse {
    //! fuser will only attempt a regular unmount when the
    //! `BackgroundSession` is dropped, but a wedged kernel mount point
    //! outlives the process that way. This wrapper forces the unmount on
    //! drop, retrying while the mount is busy.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use nix::errno::Errno;

    use super::{app_config, debug, error};
    use crate::fs::bridge::NfsFuse;
    use crate::fs::client::NfsClient;
    use fuser::BackgroundSession;

    pub struct FuseScope {
        _session: BackgroundSession,
    }

    impl FuseScope {
        pub fn spawn(
            config: &app_config::Config,
            client: Arc<NfsClient>,
        ) -> Result<Self, std::io::Error> {
            let mount_opts = [
                fuser::MountOption::FSName(format!("nfs-fs:{}", config.server())),
                fuser::MountOption::Subtype("nfs-fs".to_owned()),
                fuser::MountOption::RW,
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::DefaultPermissions,
            ];
            let session = fuser::spawn_mount2(
                NfsFuse::new(client),
                config.mount_point.to_path_buf(),
                &mount_opts,
            )?;
            Ok(Self { _session: session })
        }
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(config: &app_config::Config) -> Self {
            Self {
                mount_point: config.mount_point.to_path_buf(),
            }
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "confirming unmount of FUSE filesystem");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result =
                    nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH);
                match result {
                    Ok(()) => {
                        debug!("unmounted FUSE filesystem on attempt {}", i + 1);
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!("FUSE filesystem still busy on attempt {}, retrying", i + 1);
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!("FUSE filesystem already unmounted (attempt {})", i + 1);
                        break;
                    }
                    Err(e) => {
                        error!("failed to unmount FUSE filesystem on attempt {}: {}", i + 1, e);
                        break;
                    }
                }
            }
        }
    }
}

/// Prepare the mount point directory.
///
/// - A non-empty existing directory is an error.
/// - A missing directory is created (with parents).
/// - An empty existing directory is used as-is.
fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match std::fs::read_dir(mount_point) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(mount_point)?;
            info!(path = %mount_point.display(), "created mount point directory");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn wait_for_exit() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    if let Some(signal) = signals.forever().next() {
        debug!(signal, "received termination signal, shutting down");
    }
    Ok(())
}

/// Run the daemon to completion: mount, serve, unmount.
pub fn run(config: &app_config::Config) -> Result<(), std::io::Error> {
    prepare_mount_point(&config.mount_point)?;

    let cred = crate::rpc::tcp::AuthUnix {
        uid: config.uid,
        gid: config.gid,
        machine: nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default(),
    };

    info!(
        server = %config.server(),
        export = %config.export(),
        nconnect = config.nconnect,
        "connecting to NFS server"
    );
    let pool = crate::rpc::ConnectionPool::start(
        &config.server(),
        config.port,
        &config.export(),
        config.nconnect as usize,
        &cred,
    )
    .map_err(std::io::Error::other)?;

    let client = crate::fs::NfsClient::new(pool, config.client_config());

    info!("mounting filesystem at {}", config.mount_point.display());
    let fuse = managed_fuse::ManagedFuse::new(config);
    {
        let _session = managed_fuse::FuseScope::spawn(config, client)?;
        info!("nfs-fs is running; press Ctrl+C to stop");
        wait_for_exit()?;
    }
    drop(fuse);
    Ok(())
}
