// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Process orchestration: the single-instance check, signal tokens, the
//! fork into supervisor and worker, and liveness on both sides.
//!
//! The binary starts setuid-root. The parent drops to the invoking user
//! right after forking and from then on only renders state and posts
//! intents; the child keeps root and owns the EC. Signal handlers never
//! run logic of their own: they set process-local tokens that both loops
//! poll at their top.

use std::ffi::c_int;
use std::fs;
use std::io;
use std::process;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork, getpid, getuid, setuid};
use signal_hook::consts::{
    SIGALRM, SIGCHLD, SIGHUP, SIGINT, SIGPIPE, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2,
};

use crate::curve::FanTables;
use crate::ec::{EcChannel, EcError, EcPorts};
use crate::shared::{ShareBlock, SharedMem, WorkerView};
use crate::ui;
use crate::worker::{self, ControlWorker};

/// Name the binary runs under, as it appears in `/proc/<pid>/comm`.
pub const PROG_NAME: &str = "clevo-fanctl";

/// Signals that end either process, SIGKILL excepted.
const TERM_SIGNALS: [c_int; 8] = [
    SIGHUP, SIGINT, SIGQUIT, SIGPIPE, SIGALRM, SIGTERM, SIGUSR1, SIGUSR2,
];

/// The process-local flags the signal handlers set.
pub struct ShutdownTokens {
    /// Set when any terminating signal arrives.
    pub term: Arc<AtomicBool>,
    /// Set when a child exits (SIGCHLD).
    pub child_died: Arc<AtomicBool>,
}

/// Register both tokens. Installed before the fork so the worker inherits
/// the termination handlers with its own copy of the flags.
fn install_shutdown_tokens() -> io::Result<ShutdownTokens> {
    let term = Arc::new(AtomicBool::new(false));
    let child_died = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        signal_hook::flag::register(sig, term.clone())?;
    }
    signal_hook::flag::register(SIGCHLD, child_died.clone())?;
    Ok(ShutdownTokens { term, child_died })
}

/// Count other live processes running under `name`.
///
/// Two EC owners would race the port handshake, so a second instance must
/// refuse to start. `/proc/<pid>/comm` is the kernel's own idea of the
/// process name and needs no external tools.
pub fn count_other_instances(name: &str) -> io::Result<usize> {
    let my_pid = getpid().as_raw();
    let mut count = 0;
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        if pid == my_pid {
            continue;
        }
        let Ok(comm) = fs::read_to_string(entry.path().join("comm")) else {
            continue; // raced with a process exiting
        };
        if comm.trim_end() == name {
            count += 1;
        }
    }
    Ok(count)
}

/// Fork into the control worker and the status panel, and run both to
/// completion. Returns when the panel side is done and the worker has
/// been collected.
pub fn run_dual_process(shm: &SharedMem, ports: EcPorts, tables: FanTables) -> anyhow::Result<()> {
    let tokens = install_shutdown_tokens().context("unable to install signal handlers")?;
    let block = shm.block();
    let supervisor_pid = getpid();

    log::info!("starting supervisor and control worker");
    match unsafe { fork() }.context("unable to create the worker process")? {
        ForkResult::Child => {
            // The worker never returns into the caller's flow; two copies
            // of main must not unwind side by side.
            let code = match run_worker(ports, tables, block.worker_view(), supervisor_pid, tokens.term) {
                Ok(()) => 0,
                Err(e) => {
                    log::error!("control worker failed: {e}");
                    1
                }
            };
            process::exit(code);
        }
        ForkResult::Parent { child } => run_panel_side(block, child, &tokens),
    }
}

/// Child side: keep root, pick a transport, run the loop.
fn run_worker(
    ports: EcPorts,
    tables: FanTables,
    share: WorkerView<'_>,
    supervisor: Pid,
    term: Arc<AtomicBool>,
) -> Result<(), EcError> {
    worker::init_privileged();
    let ec = EcChannel::new(ports);
    ControlWorker::new(ec, tables, share, supervisor, term).run()
}

/// Parent side: drop privileges, run the panel, then stop and collect
/// the worker no matter how the panel came down.
fn run_panel_side(block: &ShareBlock, child: Pid, tokens: &ShutdownTokens) -> anyhow::Result<()> {
    drop_privileges()?;
    let outcome = ui::run(block.intent_view(), tokens);

    block.intent_view().request_exit();
    match waitpid(child, None) {
        Ok(status) => log::debug!("control worker exited: {status:?}"),
        Err(e) => log::debug!("control worker already collected: {e}"),
    }
    outcome
}

/// One-time drop to the invoking user. The binary runs setuid-root; the
/// panel must not keep that. Under a plain root login this is a no-op.
fn drop_privileges() -> anyhow::Result<()> {
    setuid(getuid()).context("unable to drop privileges")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_instances_of_an_unused_name() {
        let count = count_other_instances("no-such-process-name").unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn instance_scan_does_not_count_ourselves() {
        // The test runner's comm is not PROG_NAME, so this also returns
        // zero; what matters is that the scan completes on a live /proc.
        let count = count_other_instances(PROG_NAME).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn every_termination_signal_is_covered() {
        for sig in [SIGHUP, SIGINT, SIGQUIT, SIGPIPE, SIGALRM, SIGTERM, SIGUSR1, SIGUSR2] {
            assert!(TERM_SIGNALS.contains(&sig));
        }
        assert!(!TERM_SIGNALS.contains(&SIGCHLD));
    }
}
