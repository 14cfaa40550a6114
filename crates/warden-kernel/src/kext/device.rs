//! Kernel-extension device access (Windows)
//!
//! Installs the named kernel service, opens the device symbolic link and
//! issues buffered I/O control calls. Everything above this module is
//! platform-independent and talks through the `KextDevice` trait.

#![cfg(target_os = "windows")]

use super::ioctl;
use super::KextDevice;
use warden_common::{Error, Result};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Services::{
    CloseServiceHandle, CreateServiceW, DeleteService, OpenSCManagerW, OpenServiceW,
    StartServiceW, SC_MANAGER_ALL_ACCESS, SERVICE_ALL_ACCESS, SERVICE_DEMAND_START,
    SERVICE_ERROR_NORMAL, SERVICE_KERNEL_DRIVER,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_error(context: &str) -> Error {
    let code = unsafe { GetLastError() };
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{context}: win32 error {code}"),
    ))
}

/// Handle to the filter-engine device
pub struct WindowsKextDevice {
    handle: HANDLE,
}

// the handle is used behind &self with kernel-side synchronization
unsafe impl Send for WindowsKextDevice {}
unsafe impl Sync for WindowsKextDevice {}

impl WindowsKextDevice {
    /// Register and start the kernel service, then open the device
    pub fn install_and_open(driver_path: &str) -> Result<Self> {
        unsafe {
            let manager = OpenSCManagerW(std::ptr::null(), std::ptr::null(), SC_MANAGER_ALL_ACCESS);
            if manager == 0 {
                return Err(last_error("OpenSCManager"));
            }

            let name = wide(ioctl::DEVICE_NAME);
            let mut service = OpenServiceW(manager, name.as_ptr(), SERVICE_ALL_ACCESS);
            if service == 0 {
                service = CreateServiceW(
                    manager,
                    name.as_ptr(),
                    name.as_ptr(),
                    SERVICE_ALL_ACCESS,
                    SERVICE_KERNEL_DRIVER,
                    SERVICE_DEMAND_START,
                    SERVICE_ERROR_NORMAL,
                    wide(driver_path).as_ptr(),
                    std::ptr::null(),
                    std::ptr::null_mut(),
                    std::ptr::null(),
                    std::ptr::null(),
                    std::ptr::null(),
                );
                if service == 0 {
                    CloseServiceHandle(manager);
                    return Err(last_error("CreateService"));
                }
            }

            // an already-running service reports an error we can ignore
            StartServiceW(service, 0, std::ptr::null());
            CloseServiceHandle(service);
            CloseServiceHandle(manager);
        }

        Self::open()
    }

    /// Open the device of an already-running service
    pub fn open() -> Result<Self> {
        let path = wide(ioctl::DEVICE_PATH);
        let handle = unsafe {
            CreateFileW(
                path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                std::ptr::null(),
                OPEN_EXISTING,
                0,
                0,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(last_error("CreateFile"));
        }
        Ok(Self { handle })
    }

    /// Stop and unregister the kernel service
    pub fn uninstall() -> Result<()> {
        unsafe {
            let manager = OpenSCManagerW(std::ptr::null(), std::ptr::null(), SC_MANAGER_ALL_ACCESS);
            if manager == 0 {
                return Err(last_error("OpenSCManager"));
            }
            let name = wide(ioctl::DEVICE_NAME);
            let service = OpenServiceW(manager, name.as_ptr(), SERVICE_ALL_ACCESS);
            if service != 0 {
                DeleteService(service);
                CloseServiceHandle(service);
            }
            CloseServiceHandle(manager);
        }
        Ok(())
    }
}

impl KextDevice for WindowsKextDevice {
    fn ioctl(&self, code: u32, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let mut returned: u32 = 0;
        let ok = unsafe {
            DeviceIoControl(
                self.handle,
                code,
                input.as_ptr() as *const _,
                input.len() as u32,
                output.as_mut_ptr() as *mut _,
                output.len() as u32,
                &mut returned,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(last_error("DeviceIoControl"));
        }
        Ok(returned as usize)
    }
}

impl Drop for WindowsKextDevice {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.handle);
        }
    }
}
