//! Device I/O control codes
//!
//! Codes derive from `ctl_code(40000, fn, METHOD_BUFFERED, READ|WRITE)`
//! with function ordinals 0x800 through 0x807.

const DEVICE_TYPE: u32 = 40000;
const METHOD_BUFFERED: u32 = 0;
const FILE_READ_DATA: u32 = 0x0001;
const FILE_WRITE_DATA: u32 = 0x0002;

/// The NT CTL_CODE macro
const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

const fn warden_ctl(function: u32) -> u32 {
    ctl_code(
        DEVICE_TYPE,
        function,
        METHOD_BUFFERED,
        FILE_READ_DATA | FILE_WRITE_DATA,
    )
}

pub const IOCTL_VERSION: u32 = warden_ctl(0x800);
pub const IOCTL_SHUTDOWN_REQUEST: u32 = warden_ctl(0x801);
pub const IOCTL_RECV_VERDICT_REQ: u32 = warden_ctl(0x802);
pub const IOCTL_SET_VERDICT: u32 = warden_ctl(0x803);
pub const IOCTL_GET_PAYLOAD: u32 = warden_ctl(0x804);
pub const IOCTL_CLEAR_CACHE: u32 = warden_ctl(0x805);
pub const IOCTL_UPDATE_VERDICT: u32 = warden_ctl(0x806);
pub const IOCTL_GET_CONNECTION_STATS: u32 = warden_ctl(0x807);

/// Device name of the kernel extension
pub const DEVICE_NAME: &str = r"PortmasterKext";
/// Symbolic link userspace opens
pub const DEVICE_PATH: &str = r"\\.\PortmasterKext";
