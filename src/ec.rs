// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Embedded controller access.
//!
//! The Clevo EC exposes its sensors and fan actuators through two legacy
//! I/O ports: a status/command port and a data port. Every transaction is
//! a strict handshake around the controller's input/output buffer flags,
//! with bounded busy-waits so a wedged controller costs a sample instead
//! of hanging the loop. When the `ec_sys` kernel module is loaded the same
//! registers can also be snapshotted in a single debugfs read, which is
//! the preferred transport for the control loop.
//!
//! The controller has no arbitration. Whoever holds [`EcPorts`] must be
//! the only agent running the handshake for the life of the process.

use std::arch::asm;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::thread;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Hardware constants
// ---------------------------------------------------------------------------

/// Status/command port of the EC.
const EC_SC: u16 = 0x66;
/// Data port of the EC.
const EC_DATA: u16 = 0x62;

/// Status bit index: input buffer full, the EC is still consuming.
const IBF: u8 = 1;
/// Status bit index: output buffer full, a byte is ready to read.
const OBF: u8 = 0;

/// Command asking the EC to read one register.
const CMD_READ: u8 = 0x80;
/// Command asking the EC to set a fan duty.
const CMD_SET_FAN_DUTY: u8 = 0x99;

/// Size of the EC register space.
pub const EC_REG_SIZE: usize = 0x100;

const REG_CPU_TEMP: u8 = 0x07;
const REG_GPU_TEMP: u8 = 0x0A;
const REG_CPU_FAN_DUTY: u8 = 0xCE;
const REG_GPU_FAN_DUTY: u8 = 0xCF;
const REG_CPU_FAN_RPM_HI: u8 = 0xD0;
const REG_CPU_FAN_RPM_LO: u8 = 0xD1;
const REG_GPU_FAN_RPM_HI: u8 = 0xD2;
const REG_GPU_FAN_RPM_LO: u8 = 0xD3;

/// Calibration constant the EC's tachometer word divides into. Not
/// derivable; measured on the hardware.
const RPM_TIME_BASE: i32 = 2_156_220;

/// debugfs node exported by the `ec_sys` kernel module.
pub const EC_SYS_IO: &str = "/sys/kernel/debug/ec/ec0/io";

/// Poll interval inside a handshake wait.
const WAIT_POLL: Duration = Duration::from_millis(1);
/// Poll budget before a handshake step is declared timed out.
const WAIT_ATTEMPTS: u32 = 100;

// ---------------------------------------------------------------------------
// Zones
// ---------------------------------------------------------------------------

/// A thermal zone with its own sensor, fan and registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Cpu,
    Gpu,
}

impl Zone {
    pub const ALL: [Zone; 2] = [Zone::Cpu, Zone::Gpu];

    pub fn label(self) -> &'static str {
        match self {
            Zone::Cpu => "CPU",
            Zone::Gpu => "GPU",
        }
    }

    /// Selector byte for fan-duty write commands.
    fn selector(self) -> u8 {
        match self {
            Zone::Cpu => 0x01,
            Zone::Gpu => 0x02,
        }
    }

    fn temp_reg(self) -> u8 {
        match self {
            Zone::Cpu => REG_CPU_TEMP,
            Zone::Gpu => REG_GPU_TEMP,
        }
    }

    fn duty_reg(self) -> u8 {
        match self {
            Zone::Cpu => REG_CPU_FAN_DUTY,
            Zone::Gpu => REG_GPU_FAN_DUTY,
        }
    }

    fn rpm_regs(self) -> (u8, u8) {
        match self {
            Zone::Cpu => (REG_CPU_FAN_RPM_HI, REG_CPU_FAN_RPM_LO),
            Zone::Gpu => (REG_GPU_FAN_RPM_HI, REG_GPU_FAN_RPM_LO),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures talking to the EC, split by how the control loop must react.
#[derive(Debug)]
pub enum EcError {
    /// Port access was denied. Needs root; fatal at startup.
    PortAccessDenied(io::Error),
    /// A handshake wait exhausted its poll budget. Transient.
    HandshakeTimeout { port: u16, flag: u8, want: u8, status: u8 },
    /// The register image came back with the wrong length. Transient.
    ShortImage(usize),
    /// Reading the register image failed. Transient.
    ImageRead(io::Error),
    /// The debugfs node vanished mid-run. The environment changed under
    /// us; masking that would hide the cause, so it is fatal.
    TransportGone(io::Error),
}

impl EcError {
    /// Whether the error costs only this sample or must stop the loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EcError::HandshakeTimeout { .. } | EcError::ShortImage(_) | EcError::ImageRead(_)
        )
    }
}

impl fmt::Display for EcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcError::PortAccessDenied(e) => write!(f, "unable to access the EC ports: {e}"),
            EcError::HandshakeTimeout { port, flag, want, status } => write!(
                f,
                "EC handshake timeout on port {port:#04x} (status {status:#04x}, flag {flag} never read {want})"
            ),
            EcError::ShortImage(len) => write!(f, "wrong EC register image size: {len}"),
            EcError::ImageRead(e) => write!(f, "unable to read the EC register image: {e}"),
            EcError::TransportGone(e) => write!(f, "EC debugfs transport is gone: {e}"),
        }
    }
}

impl std::error::Error for EcError {}

// ---------------------------------------------------------------------------
// Raw port I/O
// ---------------------------------------------------------------------------

#[inline(always)]
unsafe fn outb(port: u16, value: u8) {
    unsafe {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }
}

#[inline(always)]
unsafe fn inb(port: u16) -> u8 {
    let mut value: u8;
    unsafe {
        asm!("in al, dx", in("dx") port, out("al") value, options(nomem, nostack, preserves_flags));
    }
    value
}

// ---------------------------------------------------------------------------
// Register snapshots
// ---------------------------------------------------------------------------

/// One snapshot of the EC's 256-byte register space.
#[derive(Debug, Clone)]
pub struct RegisterImage([u8; EC_REG_SIZE]);

impl RegisterImage {
    pub const fn zeroed() -> Self {
        Self([0; EC_REG_SIZE])
    }

    fn get(&self, reg: u8) -> u8 {
        self.0[reg as usize]
    }

    /// Zone temperature in degrees Celsius.
    pub fn temp(&self, zone: Zone) -> i32 {
        self.get(zone.temp_reg()) as i32
    }

    /// Zone fan duty in percent.
    pub fn fan_duty(&self, zone: Zone) -> i32 {
        duty_percent(self.get(zone.duty_reg()))
    }

    /// Zone fan speed in RPM.
    pub fn fan_rpm(&self, zone: Zone) -> i32 {
        let (hi, lo) = zone.rpm_regs();
        fan_rpm(self.get(hi), self.get(lo))
    }

    pub fn set_temp(&mut self, zone: Zone, celsius: u8) {
        self.0[zone.temp_reg() as usize] = celsius;
    }

    pub fn set_fan_duty_raw(&mut self, zone: Zone, raw: u8) {
        self.0[zone.duty_reg() as usize] = raw;
    }

    pub fn set_fan_rpm_raw(&mut self, zone: Zone, hi: u8, lo: u8) {
        let (hi_reg, lo_reg) = zone.rpm_regs();
        self.0[hi_reg as usize] = hi;
        self.0[lo_reg as usize] = lo;
    }
}

/// Live values for one zone, decoded.
#[derive(Debug, Clone, Copy)]
pub struct ZoneStatus {
    pub temp: i32,
    pub duty: i32,
    pub rpm: i32,
}

/// Convert a raw duty register byte (0-255) to percent.
pub fn duty_percent(raw: u8) -> i32 {
    (raw as f64 / 255.0 * 100.0).round() as i32
}

/// Convert a raw tachometer word to RPM. A zero word reads as 0 RPM
/// rather than dividing by it.
pub fn fan_rpm(hi: u8, lo: u8) -> i32 {
    let raw = ((hi as i32) << 8) | lo as i32;
    if raw > 0 { RPM_TIME_BASE / raw } else { 0 }
}

/// Convert a duty percentage to the raw register value. Writes are held
/// to the 10-100% band; the EC stalls fans below that.
fn duty_raw(pct: i32) -> u8 {
    let pct = pct.clamp(10, 100);
    (pct as f64 / 100.0 * 255.0) as u8
}

// ---------------------------------------------------------------------------
// Port-level protocol
// ---------------------------------------------------------------------------

/// Exclusive handle on the two EC I/O ports.
pub struct EcPorts {
    _priv: (),
}

impl EcPorts {
    /// Request access to both EC ports. Denied without root, and that is
    /// a startup failure rather than something to retry.
    pub fn acquire() -> Result<Self, EcError> {
        for port in [EC_DATA, EC_SC] {
            if unsafe { libc::ioperm(port as libc::c_ulong, 1, 1) } != 0 {
                return Err(EcError::PortAccessDenied(io::Error::last_os_error()));
            }
        }
        Ok(Self { _priv: () })
    }

    /// Busy-wait until bit `flag` of the status byte on `port` reads
    /// `want`, polling every millisecond up to the attempt budget.
    fn wait(&self, port: u16, flag: u8, want: u8) -> Result<(), EcError> {
        let mut status = unsafe { inb(port) };
        for _ in 0..WAIT_ATTEMPTS {
            if (status >> flag) & 0x1 == want {
                return Ok(());
            }
            thread::sleep(WAIT_POLL);
            status = unsafe { inb(port) };
        }
        Err(EcError::HandshakeTimeout { port, flag, want, status })
    }

    /// Read one register through the port handshake.
    pub fn read_register(&self, reg: u8) -> Result<u8, EcError> {
        self.wait(EC_SC, IBF, 0)?;
        unsafe { outb(EC_SC, CMD_READ) };
        self.wait(EC_SC, IBF, 0)?;
        unsafe { outb(EC_DATA, reg) };
        self.wait(EC_SC, OBF, 1)?;
        Ok(unsafe { inb(EC_DATA) })
    }

    /// Issue a command carrying a zone selector and a value byte.
    fn command(&self, cmd: u8, selector: u8, value: u8) -> Result<(), EcError> {
        self.wait(EC_SC, IBF, 0)?;
        unsafe { outb(EC_SC, cmd) };
        self.wait(EC_SC, IBF, 0)?;
        unsafe { outb(EC_DATA, selector) };
        self.wait(EC_SC, IBF, 0)?;
        unsafe { outb(EC_DATA, value) };
        self.wait(EC_SC, IBF, 0)
    }

    /// Set one zone's fan duty in percent.
    pub fn write_fan_duty(&self, zone: Zone, pct: i32) -> Result<(), EcError> {
        self.command(CMD_SET_FAN_DUTY, zone.selector(), duty_raw(pct))
    }

    /// Read one zone's current state through the port protocol. The
    /// one-shot paths use this; the control loop reads snapshots.
    pub fn read_zone(&self, zone: Zone) -> Result<ZoneStatus, EcError> {
        let (hi, lo) = zone.rpm_regs();
        Ok(ZoneStatus {
            temp: self.read_register(zone.temp_reg())? as i32,
            duty: duty_percent(self.read_register(zone.duty_reg())?),
            rpm: fan_rpm(self.read_register(hi)?, self.read_register(lo)?),
        })
    }

    /// Build a register image reading each interesting register in turn.
    fn snapshot(&self) -> Result<RegisterImage, EcError> {
        let mut image = RegisterImage::zeroed();
        for zone in Zone::ALL {
            image.set_temp(zone, self.read_register(zone.temp_reg())?);
            image.set_fan_duty_raw(zone, self.read_register(zone.duty_reg())?);
            let (hi, lo) = zone.rpm_regs();
            image.set_fan_rpm_raw(zone, self.read_register(hi)?, self.read_register(lo)?);
        }
        Ok(image)
    }
}

// ---------------------------------------------------------------------------
// The worker-facing channel
// ---------------------------------------------------------------------------

/// How register snapshots are acquired.
enum Transport {
    /// One read of the whole register space from debugfs.
    Bulk,
    /// Register-by-register over the port handshake.
    Ports,
}

/// The control loop's access path to the EC: exclusive ports plus
/// whichever snapshot transport the running kernel offers.
pub struct EcChannel {
    ports: EcPorts,
    transport: Transport,
}

impl EcChannel {
    /// Wrap acquired ports, preferring the debugfs bulk transport when
    /// the node exists.
    pub fn new(ports: EcPorts) -> Self {
        let transport = if Path::new(EC_SYS_IO).exists() {
            log::debug!("using {EC_SYS_IO} for register snapshots");
            Transport::Bulk
        } else {
            log::debug!("debugfs node missing, falling back to per-register reads");
            Transport::Ports
        };
        Self { ports, transport }
    }

    /// One whole-register-space read from debugfs. Reopened every cycle;
    /// an open failure is how we learn the node was pulled out from
    /// under us.
    fn bulk_snapshot() -> Result<RegisterImage, EcError> {
        let mut file = File::open(EC_SYS_IO).map_err(EcError::TransportGone)?;
        let mut image = RegisterImage::zeroed();
        let len = file.read(&mut image.0).map_err(EcError::ImageRead)?;
        if len != EC_REG_SIZE {
            return Err(EcError::ShortImage(len));
        }
        Ok(image)
    }
}

/// The control loop's view of the controller, substitutable in tests.
pub trait EcControl {
    /// Acquire a fresh register snapshot.
    fn snapshot(&mut self) -> Result<RegisterImage, EcError>;
    /// Set one zone's fan duty in percent.
    fn write_fan_duty(&mut self, zone: Zone, pct: i32) -> Result<(), EcError>;
}

impl EcControl for EcChannel {
    fn snapshot(&mut self) -> Result<RegisterImage, EcError> {
        match self.transport {
            Transport::Bulk => Self::bulk_snapshot(),
            Transport::Ports => self.ports.snapshot(),
        }
    }

    fn write_fan_duty(&mut self, zone: Zone, pct: i32) -> Result<(), EcError> {
        self.ports.write_fan_duty(zone, pct)
    }
}

impl<E: EcControl> EcControl for &mut E {
    fn snapshot(&mut self) -> Result<RegisterImage, EcError> {
        (**self).snapshot()
    }

    fn write_fan_duty(&mut self, zone: Zone, pct: i32) -> Result<(), EcError> {
        (**self).write_fan_duty(zone, pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_decode_rounds_to_percent() {
        assert_eq!(duty_percent(0), 0);
        assert_eq!(duty_percent(128), 50);
        assert_eq!(duty_percent(200), 78);
        assert_eq!(duty_percent(255), 100);
    }

    #[test]
    fn rpm_decode_divides_the_time_base() {
        assert_eq!(fan_rpm(0x08, 0x00), 1052);
        assert_eq!(fan_rpm(0x01, 0xF4), 4312);
    }

    #[test]
    fn rpm_decode_treats_zero_word_as_stopped() {
        assert_eq!(fan_rpm(0, 0), 0);
    }

    #[test]
    fn duty_encode_clamps_and_scales() {
        assert_eq!(duty_raw(100), 255);
        assert_eq!(duty_raw(70), 178);
        assert_eq!(duty_raw(40), 102);
        // Below the floor the write is held at 10%.
        assert_eq!(duty_raw(0), 25);
        assert_eq!(duty_raw(130), 255);
    }

    #[test]
    fn image_decodes_the_fixed_offsets() {
        let mut image = RegisterImage::zeroed();
        image.set_temp(Zone::Cpu, 61);
        image.set_temp(Zone::Gpu, 54);
        image.set_fan_duty_raw(Zone::Cpu, 200);
        image.set_fan_rpm_raw(Zone::Cpu, 0x08, 0x00);

        assert_eq!(image.temp(Zone::Cpu), 61);
        assert_eq!(image.temp(Zone::Gpu), 54);
        assert_eq!(image.fan_duty(Zone::Cpu), 78);
        assert_eq!(image.fan_rpm(Zone::Cpu), 1052);
        assert_eq!(image.fan_duty(Zone::Gpu), 0);
        assert_eq!(image.fan_rpm(Zone::Gpu), 0);
    }

    #[test]
    fn zones_use_distinct_registers() {
        for zone in Zone::ALL {
            let (hi, lo) = zone.rpm_regs();
            assert_ne!(zone.temp_reg(), zone.duty_reg());
            assert_ne!(hi, lo);
        }
        assert_ne!(Zone::Cpu.selector(), Zone::Gpu.selector());
        assert_ne!(Zone::Cpu.duty_reg(), Zone::Gpu.duty_reg());
    }
}
