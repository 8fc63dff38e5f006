//! Background worker launcher.
//!
//! `launch` forks a detached worker. The parent returns the child's pid;
//! the child re-parents to init when `detach` is set, optionally closes
//! stdio, opens its own catalog handle from the job's path and dispatches
//! the command handle. Errors never cross the process boundary, the
//! worker logs and exits non-zero.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use log::error;
use nix::unistd::{dup2, fork, setsid, ForkResult};

use catalog::BackupCatalog;

use crate::commands::CatalogCommand;
use crate::error::Result;

/// Everything a background worker needs to run.
pub struct JobInfo {
    pub detach: bool,
    pub close_std_fd: bool,
    pub catalog_path: PathBuf,
    pub cmd_handle: Box<dyn CatalogCommand>,
}

/// Forks a worker for `job`. Returns the child's pid to the parent; the
/// child never returns from this call.
pub fn launch(job: JobInfo) -> Result<i32> {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child.as_raw()),
        Ok(ForkResult::Child) => {
            let code = run_worker(job);
            std::process::exit(code);
        }
        Err(errno) => Err(std::io::Error::from_raw_os_error(errno as i32).into()),
    }
}

fn run_worker(mut job: JobInfo) -> i32 {
    if job.detach {
        // New session, re-parents to init once the launcher exits.
        let _ = setsid();
    }

    if job.close_std_fd {
        redirect_stdio_to_devnull();
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("background worker could not build runtime: {e}");
            return 1;
        }
    };

    // Workers get an independent catalog handle, never an inherited one.
    let mut catalog = BackupCatalog::new(&job.catalog_path);

    match runtime.block_on(job.cmd_handle.execute(&mut catalog, false)) {
        Ok(()) => 0,
        Err(e) => {
            error!("background worker failed: {e}");
            1
        }
    }
}

fn redirect_stdio_to_devnull() {
    if let Ok(devnull) = OpenOptions::new().read(true).write(true).open("/dev/null") {
        let fd = devnull.as_raw_fd();
        for target in 0..=2 {
            let _ = dup2(fd, target);
        }
    }
}
