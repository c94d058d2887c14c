use std::io;

use capinit_domain::{IsolationSpec, Namespace};
use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{chdir, chroot, setsid, sethostname};

/// Exit code reserved for isolation failures inside the child; the
/// parent observes it through the normal exit path.
pub const EXIT_ISOLATION: i32 = 126;

fn errno_to_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn clone_flags(namespaces: &[Namespace]) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    for ns in namespaces {
        flags |= match ns {
            Namespace::Mount => CloneFlags::CLONE_NEWNS,
            Namespace::Pid => CloneFlags::CLONE_NEWPID,
            Namespace::Net => CloneFlags::CLONE_NEWNET,
            Namespace::Uts => CloneFlags::CLONE_NEWUTS,
            Namespace::Ipc => CloneFlags::CLONE_NEWIPC,
            Namespace::User => CloneFlags::CLONE_NEWUSER,
        };
    }
    flags
}

/// Child-side setup, run between fork and exec.
///
/// Resets signal dispositions and opens a new session, reporting
/// failures there back through the spawn error. The namespace work that
/// follows cannot fail halfway and still exec a correctly confined
/// process, so any isolation failure exits with [`EXIT_ISOLATION`].
///
/// Only async-signal-safe work is allowed here.
pub fn child_setup(iso: &IsolationSpec) -> io::Result<()> {
    // Undo any dispositions inherited from the daemon before exec.
    for sig in [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGPIPE,
        Signal::SIGCHLD,
    ] {
        unsafe { signal(sig, SigHandler::SigDfl) }.map_err(errno_to_io)?;
    }
    let empty = nix::sys::signal::SigSet::empty();
    nix::sys::signal::sigprocmask(
        nix::sys::signal::SigmaskHow::SIG_SETMASK,
        Some(&empty),
        None,
    )
    .map_err(errno_to_io)?;

    setsid().map_err(errno_to_io)?;

    if apply_isolation(iso).is_err() {
        unsafe { nix::libc::_exit(EXIT_ISOLATION) }
    }

    Ok(())
}

/// Apply the configured namespace set, a private tmpfs under a mount
/// namespace, the hostname under a uts namespace, and the chroot.
fn apply_isolation(iso: &IsolationSpec) -> Result<(), Errno> {
    let flags = clone_flags(&iso.namespaces);
    if !flags.is_empty() {
        unshare(flags)?;
    }

    if iso.namespaces.contains(&Namespace::Mount) {
        // Keep mount changes private to this component, then give it a
        // scratch tmpfs of its own.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )?;
        mount(
            Some("tmpfs"),
            "/tmp",
            Some("tmpfs"),
            MsFlags::empty(),
            None::<&str>,
        )?;
    }

    if iso.namespaces.contains(&Namespace::Uts) {
        if let Some(hostname) = &iso.hostname {
            sethostname(hostname)?;
        }
    }

    if let Some(root) = &iso.root {
        chroot(root)?;
        chdir("/")?;
    }

    Ok(())
}
