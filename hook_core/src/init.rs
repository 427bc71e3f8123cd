//! Startup.  DllMain can't do any of this under the loader lock, so it starts a thread that
//! waits for the engine's renderer to exist, then sets everything up and exits.

use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use winapi::shared::dxgi::{IDXGISwapChain, DXGI_SWAP_CHAIN_DESC};
use winapi::shared::minwindef::HMODULE;
use winapi::shared::winerror::SUCCEEDED;
use winapi::um::d3d11::ID3D11DeviceContext;
use winapi::um::debugapi::OutputDebugStringW;

use shared_dx::d3d11::D3D11Context;
use shared_dx::error::{HookError, Result};
use shared_dx::util::{init_log, log_file_path, WarnOnce};
use util::memory::LocalProcess;

use crate::conf::{ScopeConf, LOG_FILE_NAME};
use crate::engine::EngineView;
use crate::hook_d3d11;
use crate::orchestrator::Orchestrator;

pub fn spawn_init_thread(module: HMODULE) {
    // HMODULE isn't Send
    let module = module as usize;
    let spawned = thread::Builder::new()
        .name("scope_overlay_init".to_string())
        .spawn(move || init_worker(module as HMODULE));
    // no log exists yet, the debugger is the only place this can go
    if let Err(e) = spawned {
        let text = spawn_failure_text(&e);
        unsafe { OutputDebugStringW(text.as_ptr()) };
    }
}

fn spawn_failure_text(e: &io::Error) -> Vec<u16> {
    util::util::to_wide_str(&format!(
        "scope overlay: init thread not started, plugin inactive: {}\n",
        e
    ))
}

fn plugin_dir(module: HMODULE) -> PathBuf {
    util::util::get_module_dir(module).unwrap_or_else(|_| PathBuf::from("."))
}

fn init_worker(module: HMODULE) {
    let dir = plugin_dir(module);
    let (conf, source) = ScopeConf::load(&dir);
    // without a log there is nowhere to report the failure; carry on regardless
    let _ = init_log(&dir, LOG_FILE_NAME, &conf.log_level);
    if let Some(path) = log_file_path() {
        info!("scope overlay loaded, logging to {}", path.display());
    }
    source.report(&conf);
    match run(&conf) {
        Ok(()) => info!("initialization complete"),
        Err(e) => error!("initialization failed, plugin inactive: {}", e),
    }
}

fn wait_for_engine(mem: &LocalProcess, conf: &ScopeConf) -> EngineView {
    let mut unreadable = WarnOnce::new();
    let mut polls: u64 = 0;
    loop {
        match EngineView::resolve(mem, &conf.engine) {
            Ok(Some(view)) => {
                info!(
                    "renderer found after {} polls: device {:x}, context {:x}, swap chain {:x}",
                    polls, view.device, view.context, view.swap_chain
                );
                return view;
            }
            Ok(None) => {}
            Err(e) => {
                if unreadable.first() {
                    warn!("renderer not readable yet (still polling): {}", e);
                }
            }
        }
        polls += 1;
        if polls % 100 == 0 {
            debug!("still waiting for renderer ({} polls)", polls);
        }
        thread::sleep(Duration::from_millis(conf.init_poll_ms));
    }
}

unsafe fn swap_chain_size(swap_chain: usize) -> Option<(u32, u32)> {
    let sc = swap_chain as *mut IDXGISwapChain;
    let mut desc: DXGI_SWAP_CHAIN_DESC = std::mem::zeroed();
    if !SUCCEEDED((*sc).GetDesc(&mut desc)) {
        return None;
    }
    Some((desc.BufferDesc.Width, desc.BufferDesc.Height))
}

fn run(conf: &ScopeConf) -> Result<()> {
    let mem = LocalProcess;
    let view = wait_for_engine(&mem, conf);
    let ctx = unsafe { D3D11Context::from_context_ptr(view.context as *mut ID3D11DeviceContext) }
        .ok_or(HookError::D3D11NoContext)?;
    let size = unsafe { swap_chain_size(view.swap_chain) };
    if size.is_none() {
        warn!("could not read swap chain size; masks will be created on first use");
    }

    let mut orchestrator = Orchestrator::new(conf, LocalProcess, ctx, view);
    // patch first: nothing may run through the foreign module's hooked path unpatched once we
    // start processing frames
    let bridge_active = unsafe { orchestrator.initialize_bridge(size) };
    info!("frame generation bridge active: {}", bridge_active);
    hook_d3d11::store_runtime(orchestrator)?;
    unsafe { hook_d3d11::install_hooks(&mem, view.swap_chain, view.context) }
}
