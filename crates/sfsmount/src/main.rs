//! Mount helper for the sentryfs overlay.
//!
//! ```text
//! sfsmount <backing_dir> <mount_point> [-o option[,option...]]...
//! ```
//!
//! Options the overlay recognizes are consumed here; everything else is
//! forwarded to the FUSE session:
//!
//! * `append_only_dirs=name1,name2,…` — subtrees (relative to the mount
//!   root) placed under append-only policy. The whole remainder of the
//!   option string is the list, so pass this as its own `-o`.
//! * `verify=strict|relaxed` — writer-open verification mode.
//! * `checksums=file|block` — whole-file or per-block checksums.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fuser::MountOption;

use sentryfs::{Overlay, OverlayConfig, WormPolicy};

/// Integrity overlay mount: checksums, sidecar xattrs and append-only trees.
#[derive(Debug, Parser)]
#[clap(name = "sfsmount", version)]
struct App {
    /// The directory to mirror (the sidecar database lives here)
    backing_dir: PathBuf,

    /// Where to mount the overlay
    mount_point: PathBuf,

    /// Mount options, mount(8) style; may be repeated
    #[clap(short = 'o', value_name = "OPTIONS")]
    options: Vec<String>,

    /// Accepted for mount-tool compatibility; sfsmount always runs in the
    /// foreground
    #[clap(short = 'f', long = "foreground")]
    foreground: bool,
}

fn fuse_option(opt: &str) -> MountOption {
    match opt {
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "dirsync" => MountOption::DirSync,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        other => MountOption::CUSTOM(other.to_string()),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let app = App::parse();

    let mut config = OverlayConfig::new(&app.backing_dir);
    let mut fuse_options = vec![MountOption::FSName("sentryfs".to_string())];

    for option in &app.options {
        if let Some(csv) = option.strip_prefix("append_only_dirs=") {
            config.worm = WormPolicy::from_csv(csv);
        } else if let Some(mode) = option.strip_prefix("verify=") {
            config.verify = match mode.parse() {
                Ok(mode) => mode,
                Err(err) => bail!("-o verify: {err}"),
            };
        } else if let Some(mode) = option.strip_prefix("checksums=") {
            config.granularity = match mode.parse() {
                Ok(mode) => mode,
                Err(err) => bail!("-o checksums: {err}"),
            };
        } else {
            fuse_options.extend(option.split(',').filter(|s| !s.is_empty()).map(fuse_option));
        }
    }

    let overlay = Overlay::open(config).with_context(|| {
        format!(
            "unable to open overlay sidecar in {}",
            app.backing_dir.display()
        )
    })?;

    sentryfs_fuse::mount(overlay, &app.mount_point, &fuse_options)
        .with_context(|| format!("unable to mount at {}", app.mount_point.display()))?;

    Ok(())
}
