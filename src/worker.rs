// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The privileged control loop.
//!
//! Runs in the forked child as root, the only code in the system allowed
//! to touch the EC. Every cycle it applies any pending manual request,
//! snapshots the registers, publishes the decoded values, and in automatic
//! mode lets the per-zone tables drive the fans. A transient EC failure
//! costs one sample; losing the snapshot transport ends the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::{Pid, Uid, setuid};

use crate::curve::FanTables;
use crate::ec::{EcControl, EcError, RegisterImage, Zone};
use crate::shared::{FanReadings, WorkerView};

/// Fixed control period.
const CONTROL_PERIOD: Duration = Duration::from_millis(200);

/// Prepare the child process for EC work: keep root for module loading
/// and debugfs access, then try to expose the bulk register interface.
pub fn init_privileged() {
    if let Err(e) = setuid(Uid::from_raw(0)) {
        log::warn!("could not switch to uid 0: {e}");
    }
    // Best effort; without the module the port protocol still works.
    match std::process::Command::new("modprobe").arg("ec_sys").status() {
        Ok(status) if status.success() => {}
        Ok(status) => log::debug!("modprobe ec_sys exited with {status}"),
        Err(e) => log::debug!("modprobe ec_sys did not run: {e}"),
    }
}

/// The control loop state: an EC channel, the fan tables, the worker's
/// half of the shared block, and the stop conditions.
pub struct ControlWorker<'a, E> {
    ec: E,
    tables: FanTables,
    share: WorkerView<'a>,
    /// Supervisor pid, probed for liveness every cycle.
    parent: Pid,
    /// Process-local termination token set from the signal path.
    term: Arc<AtomicBool>,
    period: Duration,
}

impl<'a, E: EcControl> ControlWorker<'a, E> {
    pub fn new(
        ec: E,
        tables: FanTables,
        share: WorkerView<'a>,
        parent: Pid,
        term: Arc<AtomicBool>,
    ) -> Self {
        Self { ec, tables, share, parent, term, period: CONTROL_PERIOD }
    }

    /// Override the control period; tests run with a tiny one.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Drive the loop until a stop condition appears, then return. A
    /// non-transient transport failure aborts with the error instead.
    pub fn run(&mut self) -> Result<(), EcError> {
        log::info!("control worker running");
        while !self.should_stop() {
            self.run_once()?;
            thread::sleep(self.period);
        }
        log::info!("control worker exiting");
        Ok(())
    }

    /// True when any stop condition holds: a termination signal arrived,
    /// the supervisor asked us to exit, or the supervisor itself is gone.
    fn should_stop(&self) -> bool {
        if self.term.load(Ordering::Relaxed) {
            log::info!("worker stopping on signal");
            return true;
        }
        if self.share.should_exit() {
            log::info!("worker stopping on supervisor request");
            return true;
        }
        if kill(self.parent, None).is_err() {
            log::warn!("worker stopping, supervisor died");
            return true;
        }
        false
    }

    /// One control cycle.
    fn run_once(&mut self) -> Result<(), EcError> {
        self.apply_manual_request();

        let image = match self.ec.snapshot() {
            Ok(image) => image,
            Err(e) if e.is_transient() => {
                // Sample lost; nothing else is written this cycle either,
                // a decision on stale readings is worse than no decision.
                log::warn!("dropping this sample: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let readings = decode(&image);
        self.share.publish(&readings);
        log::trace!(
            "cpu {}°C {}% {}rpm, gpu {}°C {}% {}rpm",
            readings.cpu_temp,
            readings.cpu_duty,
            readings.cpu_rpm,
            readings.gpu_temp,
            readings.gpu_duty,
            readings.gpu_rpm,
        );

        if self.share.auto_mode() {
            self.run_auto(&readings);
        }
        Ok(())
    }

    /// Apply a pending manual duty to both zones, once per posted value.
    /// A failed write leaves the request pending so the next cycle
    /// retries it.
    fn apply_manual_request(&mut self) {
        let pending = self.share.manual_request();
        if pending == 0 || pending == self.share.manual_applied() {
            return;
        }
        log::info!("applying manual fan duty {pending}%");
        match self.write_both(pending) {
            Ok(()) => self.share.record_manual_applied(pending),
            Err(e) => log::warn!("manual duty write failed, will retry: {e}"),
        }
    }

    fn write_both(&mut self, duty: i32) -> Result<(), EcError> {
        for zone in Zone::ALL {
            self.ec.write_fan_duty(zone, duty)?;
        }
        Ok(())
    }

    /// Let each zone's table look at the fresh readings and write any
    /// target it produces, deduplicated per zone.
    fn run_auto(&mut self, r: &FanReadings) {
        for zone in Zone::ALL {
            let (temp, duty, table) = match zone {
                Zone::Cpu => (r.cpu_temp, r.cpu_duty, &self.tables.cpu),
                Zone::Gpu => (r.gpu_temp, r.gpu_duty, &self.tables.gpu),
            };
            let target = table.target_duty(temp, duty);
            if target == 0 || target == self.share.auto_applied(zone) {
                continue;
            }
            log::info!("{} {temp}°C, auto fan duty to {target}%", zone.label());
            match self.ec.write_fan_duty(zone, target) {
                Ok(()) => self.share.record_auto_applied(zone, target),
                Err(e) => log::warn!("{} auto duty write failed: {e}", zone.label()),
            }
        }
    }
}

/// Decode the registers the mirror carries out of a snapshot.
fn decode(image: &RegisterImage) -> FanReadings {
    FanReadings {
        cpu_temp: image.temp(Zone::Cpu),
        gpu_temp: image.temp(Zone::Gpu),
        cpu_duty: image.fan_duty(Zone::Cpu),
        cpu_rpm: image.fan_rpm(Zone::Cpu),
        gpu_duty: image.fan_duty(Zone::Gpu),
        gpu_rpm: image.fan_rpm(Zone::Gpu),
    }
}
