/*!
 * The plugin dll.  Hooks the engine's Present and DrawIndexed, replays the HDR composite's state
 * at Present, and drives the frame generation bridge.
 *
 * Everything except the trampolines, the init thread and `DllMain` is plain Rust over the
 * `GraphicsContext` and `ProcessMemory` seams, and is tested against their mocks.
*/
#![allow(non_snake_case)]

pub mod conf;
pub mod engine;
pub mod metrics;
pub mod orchestrator;

#[cfg(windows)]
mod hook_d3d11;
#[cfg(windows)]
mod init;

#[cfg(windows)]
use winapi::shared::minwindef::{BOOL, DWORD, HINSTANCE, LPVOID, TRUE};
#[cfg(windows)]
use winapi::um::winnt::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

#[cfg(windows)]
#[no_mangle]
pub extern "system" fn DllMain(module: HINSTANCE, reason: DWORD, reserved: LPVOID) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => init::spawn_init_thread(module),
        // reserved is non-null when the whole process is exiting
        DLL_PROCESS_DETACH => hook_d3d11::shutdown(!reserved.is_null()),
        _ => {}
    }
    TRUE
}
