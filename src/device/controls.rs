//! Sensor control translation into V4L2 control writes
//!
//! Commands are first encoded into an ordered list of control writes, then
//! issued with `VIDIOC_S_CTRL` on the session's control descriptor. The two
//! steps are separate so the encoding is testable without a device.

use std::io;
use std::os::unix::io::RawFd;

use crate::control::ControlCommand;

// ===== V4L2 control class bases =====
const V4L2_CTRL_CLASS_USER: u32 = 0x0098_0000;
const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a_0000;

const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;

// ===== Control IDs the relay drives =====

/// Automatic white balance on/off
pub const V4L2_CID_AUTO_WHITE_BALANCE: u32 = V4L2_CID_BASE + 12;
/// White balance temperature in Kelvin
pub const V4L2_CID_WHITE_BALANCE_TEMPERATURE: u32 = V4L2_CID_BASE + 26;
/// Exposure mode: auto, manual, shutter/aperture priority
pub const V4L2_CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
/// Absolute exposure time in 100us units
pub const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;
/// Absolute lens position
pub const V4L2_CID_FOCUS_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 10;
/// Continuous autofocus on/off
pub const V4L2_CID_FOCUS_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;
/// ISO sensitivity value
pub const V4L2_CID_ISO_SENSITIVITY: u32 = V4L2_CID_CAMERA_CLASS_BASE + 23;
/// One-shot autofocus trigger
pub const V4L2_CID_AUTO_FOCUS_START: u32 = V4L2_CID_CAMERA_CLASS_BASE + 28;

// ===== Exposure mode menu values =====
pub const V4L2_EXPOSURE_AUTO: i32 = 0;
pub const V4L2_EXPOSURE_MANUAL: i32 = 1;

/// Set control value (v4l2_control: 8 bytes)
const VIDIOC_S_CTRL: libc::c_ulong = 0xC008_561C;

/// V4L2 control set structure
#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

/// One control write bound for the inbound control stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlWrite {
    pub id: u32,
    pub value: i32,
}

impl CtrlWrite {
    fn new(id: u32, value: i32) -> Self {
        Self { id, value }
    }
}

/// Seed for the manual exposure cache before any manual pair was issued
pub const DEFAULT_MANUAL_EXPOSURE_US: u32 = 20_000;
pub const DEFAULT_MANUAL_ISO: u32 = 400;

/// Turns panel commands into ordered control writes.
///
/// Remembers the last manual (exposure, ISO) pair so disabling auto exposure
/// restores exactly what the user had set, not a device default. Exposure
/// time and ISO are always written together; the device does not accept one
/// without the other.
#[derive(Debug)]
pub struct ControlTranslator {
    last_manual: (u32, u32),
}

impl ControlTranslator {
    pub fn new() -> Self {
        Self {
            last_manual: (DEFAULT_MANUAL_EXPOSURE_US, DEFAULT_MANUAL_ISO),
        }
    }

    pub fn encode(&mut self, cmd: ControlCommand) -> Vec<CtrlWrite> {
        match cmd {
            ControlCommand::SetManualFocus(level) => vec![
                CtrlWrite::new(V4L2_CID_FOCUS_AUTO, 0),
                CtrlWrite::new(V4L2_CID_FOCUS_ABSOLUTE, i32::from(level)),
            ],
            ControlCommand::TriggerAutofocus => vec![
                CtrlWrite::new(V4L2_CID_FOCUS_AUTO, 1),
                CtrlWrite::new(V4L2_CID_AUTO_FOCUS_START, 1),
            ],
            ControlCommand::SetManualExposure { time_us, iso } => {
                self.last_manual = (time_us, iso);
                Self::manual_exposure(time_us, iso)
            }
            ControlCommand::SetAutoExposure(true) => {
                vec![CtrlWrite::new(V4L2_CID_EXPOSURE_AUTO, V4L2_EXPOSURE_AUTO)]
            }
            ControlCommand::SetAutoExposure(false) => {
                let (time_us, iso) = self.last_manual;
                Self::manual_exposure(time_us, iso)
            }
            ControlCommand::SetWhiteBalance(kelvin) => vec![
                CtrlWrite::new(V4L2_CID_AUTO_WHITE_BALANCE, 0),
                CtrlWrite::new(V4L2_CID_WHITE_BALANCE_TEMPERATURE, kelvin as i32),
            ],
        }
    }

    fn manual_exposure(time_us: u32, iso: u32) -> Vec<CtrlWrite> {
        // EXPOSURE_ABSOLUTE is in 100us units; never round down to zero
        let units = (time_us / 100).max(1) as i32;
        vec![
            CtrlWrite::new(V4L2_CID_EXPOSURE_AUTO, V4L2_EXPOSURE_MANUAL),
            CtrlWrite::new(V4L2_CID_EXPOSURE_ABSOLUTE, units),
            CtrlWrite::new(V4L2_CID_ISO_SENSITIVITY, iso as i32),
        ]
    }
}

impl Default for ControlTranslator {
    fn default() -> Self {
        Self::new()
    }
}

/// Issue a single control write on an open V4L2 descriptor
pub fn apply(fd: RawFd, write: CtrlWrite) -> io::Result<()> {
    let mut ctrl = V4l2Control {
        id: write.id,
        value: write.value,
    };
    let ret = unsafe { libc::ioctl(fd, VIDIOC_S_CTRL as _, &mut ctrl as *mut V4l2Control) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
