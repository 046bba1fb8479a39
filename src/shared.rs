// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Process-shared control state.
//!
//! One page of anonymous shared memory carries everything the two
//! processes exchange: the live sensor mirror, the mode and intent fields,
//! and the shutdown flag. There is no lock. Every field has exactly one
//! writing side, all accesses are whole-word atomic loads and stores, and
//! each process only gets the view that can write its own fields:
//!
//! - [`WorkerView`] (control worker): writes the six sensor fields,
//!   `manual_applied` and the per-zone auto markers it refreshes after an
//!   EC write; reads intents.
//! - [`IntentView`] (supervisor/panel): writes `should_exit`, `auto_mode`
//!   and `manual_request`, and clears the auto markers when posting a new
//!   intent; reads the mirror.

use std::ffi::c_void;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

use crate::ec::Zone;

/// Length of the shared mapping. One page, far more than the block needs.
const SHARE_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// The block
// ---------------------------------------------------------------------------

/// The fixed-layout block both processes map.
#[repr(C)]
pub struct ShareBlock {
    should_exit: AtomicBool,
    auto_mode: AtomicBool,
    cpu_temp: AtomicI32,
    gpu_temp: AtomicI32,
    cpu_duty: AtomicI32,
    cpu_rpm: AtomicI32,
    gpu_duty: AtomicI32,
    gpu_rpm: AtomicI32,
    manual_request: AtomicI32,
    manual_applied: AtomicI32,
    auto_applied_cpu: AtomicI32,
    auto_applied_gpu: AtomicI32,
}

const _: () = assert!(std::mem::size_of::<ShareBlock>() <= SHARE_LEN);

impl ShareBlock {
    /// Fresh block: automatic mode on, nothing pending, nothing read yet.
    pub const fn new() -> Self {
        Self {
            should_exit: AtomicBool::new(false),
            auto_mode: AtomicBool::new(true),
            cpu_temp: AtomicI32::new(0),
            gpu_temp: AtomicI32::new(0),
            cpu_duty: AtomicI32::new(0),
            cpu_rpm: AtomicI32::new(0),
            gpu_duty: AtomicI32::new(0),
            gpu_rpm: AtomicI32::new(0),
            manual_request: AtomicI32::new(0),
            manual_applied: AtomicI32::new(0),
            auto_applied_cpu: AtomicI32::new(0),
            auto_applied_gpu: AtomicI32::new(0),
        }
    }

    pub fn worker_view(&self) -> WorkerView<'_> {
        WorkerView { block: self }
    }

    pub fn intent_view(&self) -> IntentView<'_> {
        IntentView { block: self }
    }
}

impl Default for ShareBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// The worker-written sensor mirror as one plain value, for display code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanReadings {
    pub cpu_temp: i32,
    pub gpu_temp: i32,
    pub cpu_duty: i32,
    pub cpu_rpm: i32,
    pub gpu_duty: i32,
    pub gpu_rpm: i32,
}

// ---------------------------------------------------------------------------
// Role views
// ---------------------------------------------------------------------------

/// The control worker's half of the block.
pub struct WorkerView<'a> {
    block: &'a ShareBlock,
}

impl WorkerView<'_> {
    pub fn should_exit(&self) -> bool {
        self.block.should_exit.load(Ordering::Relaxed)
    }

    pub fn auto_mode(&self) -> bool {
        self.block.auto_mode.load(Ordering::Relaxed)
    }

    /// Pending manual duty request; 0 when none is outstanding.
    pub fn manual_request(&self) -> i32 {
        self.block.manual_request.load(Ordering::Relaxed)
    }

    pub fn manual_applied(&self) -> i32 {
        self.block.manual_applied.load(Ordering::Relaxed)
    }

    pub fn record_manual_applied(&self, duty: i32) {
        self.block.manual_applied.store(duty, Ordering::Relaxed);
    }

    /// Publish a decoded snapshot for the presentation side.
    pub fn publish(&self, r: &FanReadings) {
        self.block.cpu_temp.store(r.cpu_temp, Ordering::Relaxed);
        self.block.gpu_temp.store(r.gpu_temp, Ordering::Relaxed);
        self.block.cpu_duty.store(r.cpu_duty, Ordering::Relaxed);
        self.block.cpu_rpm.store(r.cpu_rpm, Ordering::Relaxed);
        self.block.gpu_duty.store(r.gpu_duty, Ordering::Relaxed);
        self.block.gpu_rpm.store(r.gpu_rpm, Ordering::Relaxed);
    }

    /// Last duty the automatic algorithm wrote for a zone, 0 after an
    /// intent cleared it.
    pub fn auto_applied(&self, zone: Zone) -> i32 {
        self.marker(zone).load(Ordering::Relaxed)
    }

    pub fn record_auto_applied(&self, zone: Zone, duty: i32) {
        self.marker(zone).store(duty, Ordering::Relaxed);
    }

    fn marker(&self, zone: Zone) -> &AtomicI32 {
        match zone {
            Zone::Cpu => &self.block.auto_applied_cpu,
            Zone::Gpu => &self.block.auto_applied_gpu,
        }
    }
}

/// The supervisor/panel half of the block.
pub struct IntentView<'a> {
    block: &'a ShareBlock,
}

impl IntentView<'_> {
    pub fn readings(&self) -> FanReadings {
        FanReadings {
            cpu_temp: self.block.cpu_temp.load(Ordering::Relaxed),
            gpu_temp: self.block.gpu_temp.load(Ordering::Relaxed),
            cpu_duty: self.block.cpu_duty.load(Ordering::Relaxed),
            cpu_rpm: self.block.cpu_rpm.load(Ordering::Relaxed),
            gpu_duty: self.block.gpu_duty.load(Ordering::Relaxed),
            gpu_rpm: self.block.gpu_rpm.load(Ordering::Relaxed),
        }
    }

    pub fn auto_mode(&self) -> bool {
        self.block.auto_mode.load(Ordering::Relaxed)
    }

    pub fn manual_applied(&self) -> i32 {
        self.block.manual_applied.load(Ordering::Relaxed)
    }

    /// Ask the worker to hold both fans at a fixed duty.
    ///
    /// The auto markers are cleared here: if automatic mode is re-entered
    /// later, a stale marker could suppress the first target the table
    /// produces.
    pub fn request_manual_duty(&self, duty: i32) {
        self.block.auto_mode.store(false, Ordering::Relaxed);
        self.clear_auto_markers();
        self.block.manual_request.store(duty, Ordering::Relaxed);
    }

    /// Hand fan control back to the tables.
    pub fn request_auto(&self) {
        self.clear_auto_markers();
        self.block.manual_request.store(0, Ordering::Relaxed);
        self.block.auto_mode.store(true, Ordering::Relaxed);
    }

    /// Tell the worker to leave its loop at the next check.
    pub fn request_exit(&self) {
        self.block.should_exit.store(true, Ordering::Relaxed);
    }

    fn clear_auto_markers(&self) {
        self.block.auto_applied_cpu.store(0, Ordering::Relaxed);
        self.block.auto_applied_gpu.store(0, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// The mapping
// ---------------------------------------------------------------------------

/// Owner of the anonymous shared mapping holding a [`ShareBlock`].
///
/// Created by the supervisor before forking; the same physical page backs
/// the block in both processes afterwards. Each process unmaps its own
/// view when its handle drops.
pub struct SharedMem {
    ptr: NonNull<ShareBlock>,
}

impl SharedMem {
    /// Map and initialise a fresh block. Failing here means dual-process
    /// mode cannot run at all.
    pub fn create() -> io::Result<Self> {
        const LEN: NonZeroUsize = NonZeroUsize::new(SHARE_LEN).unwrap();
        let raw = unsafe {
            mmap_anonymous(
                None,
                LEN,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(io::Error::from)?;
        let ptr = raw.cast::<ShareBlock>();
        unsafe { ptr.as_ptr().write(ShareBlock::new()) };
        Ok(Self { ptr })
    }

    /// The mapped block. Valid for the life of `self`, in the forked
    /// child as well.
    pub fn block(&self) -> &ShareBlock {
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for SharedMem {
    fn drop(&mut self) {
        // The block is plain atomics; unmapping is the only cleanup.
        if let Err(e) = unsafe { munmap(self.ptr.cast::<c_void>(), SHARE_LEN) } {
            log::warn!("failed to unmap shared state: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fresh_block_starts_in_auto_with_nothing_pending() {
        let block = ShareBlock::new();
        let worker = block.worker_view();
        assert!(!worker.should_exit());
        assert!(worker.auto_mode());
        assert_eq!(worker.manual_request(), 0);
        assert_eq!(block.intent_view().readings(), FanReadings::default());
    }

    #[test]
    fn manual_intent_clears_the_auto_markers() {
        let block = ShareBlock::new();
        let worker = block.worker_view();
        let ui = block.intent_view();

        worker.record_auto_applied(Zone::Cpu, 45);
        worker.record_auto_applied(Zone::Gpu, 35);
        ui.request_manual_duty(70);

        assert!(!worker.auto_mode());
        assert_eq!(worker.manual_request(), 70);
        assert_eq!(worker.auto_applied(Zone::Cpu), 0);
        assert_eq!(worker.auto_applied(Zone::Gpu), 0);
    }

    #[test]
    fn auto_reentry_clears_markers_and_the_pending_request() {
        let block = ShareBlock::new();
        let worker = block.worker_view();
        let ui = block.intent_view();

        ui.request_manual_duty(70);
        worker.record_auto_applied(Zone::Cpu, 45);
        ui.request_auto();

        assert!(worker.auto_mode());
        assert_eq!(worker.manual_request(), 0);
        assert_eq!(worker.auto_applied(Zone::Cpu), 0);
    }

    #[test]
    fn readings_round_trip_through_the_mirror() {
        let block = ShareBlock::new();
        let r = FanReadings {
            cpu_temp: 61,
            gpu_temp: 54,
            cpu_duty: 45,
            cpu_rpm: 3100,
            gpu_duty: 35,
            gpu_rpm: 2800,
        };
        block.worker_view().publish(&r);
        assert_eq!(block.intent_view().readings(), r);
    }

    #[test]
    fn exit_request_reaches_the_worker_side() {
        let block = ShareBlock::new();
        assert!(!block.worker_view().should_exit());
        block.intent_view().request_exit();
        assert!(block.worker_view().should_exit());
    }

    // Each role writes values only from its own namespace (worker: even,
    // panel: odd duties); after concurrent traffic every field must still
    // hold a value its writing role produced, or a cleared 0.
    #[test]
    fn fields_keep_a_single_writing_role() {
        let block = ShareBlock::new();
        thread::scope(|s| {
            s.spawn(|| {
                let worker = block.worker_view();
                for i in 0..500 {
                    let v = i * 2;
                    worker.publish(&FanReadings {
                        cpu_temp: v,
                        gpu_temp: v,
                        cpu_duty: v,
                        cpu_rpm: v,
                        gpu_duty: v,
                        gpu_rpm: v,
                    });
                    worker.record_auto_applied(Zone::Cpu, v);
                    worker.record_auto_applied(Zone::Gpu, v);
                    worker.record_manual_applied(v);
                }
            });
            s.spawn(|| {
                let ui = block.intent_view();
                for i in 0..500 {
                    ui.request_manual_duty(2 * i + 1);
                    if i % 3 == 0 {
                        ui.request_auto();
                    }
                }
            });
        });

        let worker = block.worker_view();
        let r = block.intent_view().readings();
        for v in [r.cpu_temp, r.gpu_temp, r.cpu_duty, r.cpu_rpm, r.gpu_duty, r.gpu_rpm] {
            assert_eq!(v % 2, 0, "worker-owned field holds a panel-side value");
        }
        assert_eq!(worker.manual_applied() % 2, 0);
        let pending = worker.manual_request();
        assert!(
            pending == 0 || pending % 2 == 1,
            "panel-owned field holds a worker-side value"
        );
        for zone in Zone::ALL {
            assert_eq!(worker.auto_applied(zone) % 2, 0);
        }
    }
}
