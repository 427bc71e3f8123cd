use std::ffi::OsString;
use std::path::PathBuf;

use winapi::shared::minwindef::{DWORD, HMODULE};
use winapi::um::libloaderapi::{GetModuleFileNameW, GetModuleHandleW};

use shared_dx::error::*;

pub unsafe fn protect_memory(
    target: *mut winapi::ctypes::c_void,
    size: usize,
    protection: u32,
) -> Result<u32> {
    let process = winapi::um::processthreadsapi::GetCurrentProcess();
    let mut old_protection = winapi::um::winnt::PAGE_READWRITE;
    if winapi::um::memoryapi::VirtualProtectEx(
        process,
        target,
        size,
        protection,
        (&mut old_protection) as *mut u32,
    ) > 0
    {
        Ok(old_protection)
    } else {
        Err(HookError::ProtectFailed {
            address: target as usize,
            len: size,
        })
    }
}

pub fn to_wide_str(s: &str) -> Vec<u16> {
    use std::ffi::OsStr;
    use std::iter::once;
    use std::os::windows::ffi::OsStrExt;

    OsStr::new(s).encode_wide().chain(once(0)).collect()
}

/// Handle (= load address) of an already loaded module.  Does not load anything.
pub fn module_handle(name: Option<&str>) -> Option<HMODULE> {
    let handle = match name {
        None => unsafe { GetModuleHandleW(std::ptr::null()) },
        Some(n) => {
            let wide = to_wide_str(n);
            unsafe { GetModuleHandleW(wide.as_ptr()) }
        }
    };
    if handle.is_null() {
        None
    } else {
        Some(handle)
    }
}

/// Full path of a module; `h` null means the host executable.
pub fn get_module_name(h: HMODULE) -> Result<String> {
    use std::os::windows::prelude::*;

    let ssize = 65535;
    let mut mpath: Vec<u16> = vec![0; ssize];
    let r = unsafe { GetModuleFileNameW(h, mpath.as_mut_ptr(), ssize as DWORD) };
    if r == 0 {
        return Err(HookError::ModuleNotFound(format!(
            "failed to get module file name for {:?}",
            h
        )));
    }
    let s = OsString::from_wide(&mpath[0..r as usize]).into_string()?;
    Ok(s)
}

/// Directory holding the module `h`.
pub fn get_module_dir(h: HMODULE) -> Result<PathBuf> {
    let name = get_module_name(h)?;
    let mut p = PathBuf::from(name);
    p.pop();
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_module_handle() {
        assert!(module_handle(None).is_some());
        assert!(module_handle(Some("kernel32.dll")).is_some());
        assert!(module_handle(Some("unlikely_ducksarecool.dll")).is_none());
    }

    #[test]
    pub fn test_protect_round_trip() {
        let mut buf = vec![0u8; 64];
        let p = buf.as_mut_ptr() as *mut winapi::ctypes::c_void;
        unsafe {
            let old = protect_memory(p, buf.len(), winapi::um::winnt::PAGE_EXECUTE_READWRITE)
                .expect("unprotect");
            let mid = protect_memory(p, buf.len(), old).expect("protect");
            assert_eq!(mid, winapi::um::winnt::PAGE_EXECUTE_READWRITE);
        }
    }
}
