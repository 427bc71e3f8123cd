//! The Present and DrawIndexed trampolines, and the state they share.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use lazy_static::lazy_static;
use tracing::{error, info};
use winapi::shared::dxgi::IDXGISwapChain;
use winapi::shared::minwindef::{INT, UINT};
use winapi::shared::winerror::S_OK;
use winapi::um::d3d11::ID3D11DeviceContext;
use winapi::um::winnt::HRESULT;

use patcher::vtable::{fn_from_addr, VTableHook};
use shared_dx::d3d11::D3D11Context;
use shared_dx::defs_dx11::*;
use shared_dx::error::{HookError, Result};
use util::memory::LocalProcess;

use crate::orchestrator::{DrawParams, Orchestrator};

pub type D3D11Orchestrator = Orchestrator<D3D11Context, LocalProcess>;

/// The orchestrator holds COM pointers.  It is built on the init thread and from then on only
/// used on the render thread, always under `RUNTIME`'s lock.
pub struct RenderThreadState(pub D3D11Orchestrator);
unsafe impl Send for RenderThreadState {}

pub struct InstalledHooks {
    pub present: VTableHook,
    pub draw_indexed: VTableHook,
}

static HOOKS: OnceLock<InstalledHooks> = OnceLock::new();
// set before the slot is redirected, so a trampoline always has somewhere to forward to
static REAL_PRESENT: OnceLock<PresentFn> = OnceLock::new();
static REAL_DRAW_INDEXED: OnceLock<DrawIndexedFn> = OnceLock::new();
static PANIC_LOGGED: AtomicBool = AtomicBool::new(false);

lazy_static! {
    static ref RUNTIME: Mutex<Option<RenderThreadState>> = Mutex::new(None);
}

fn real_present() -> Option<PresentFn> {
    REAL_PRESENT.get().copied()
}

fn real_draw_indexed() -> Option<DrawIndexedFn> {
    REAL_DRAW_INDEXED.get().copied()
}

unsafe fn publish<F: Copy>(cell: &OnceLock<F>, original: usize) -> Result<()> {
    let f = fn_from_addr::<F>(original)
        .ok_or_else(|| HookError::BadStateError(format!("bad original {:x}", original)))?;
    cell.set(f)
        .map_err(|_| HookError::BadStateError("original already published".to_string()))
}

/// Read the slot's original, publish it, and only then redirect the slot.
unsafe fn hook_slot<F: Copy>(
    hook: &mut VTableHook,
    real: &OnceLock<F>,
    mem: &LocalProcess,
    object: usize,
) -> Result<()> {
    let original = hook.read_original(mem, object)?;
    publish(real, original)?;
    hook.redirect(mem, object, original)
}

fn log_panic(hook: &str) {
    if !PANIC_LOGGED.swap(true, Ordering::Relaxed) {
        error!("panic in {} hook; the rest of this frame's work was skipped", hook);
    }
}

/// Run `f` on the orchestrator if `swap_chain` is the engine's.  Panics stop here.
fn with_engine_present(swap_chain: usize, f: impl FnOnce(&mut D3D11Orchestrator)) {
    let mut guard = match RUNTIME.lock() {
        Ok(g) => g,
        Err(_) => return,
    };
    let rt = match guard.as_mut() {
        Some(rt) => rt,
        None => return,
    };
    if !rt.0.is_engine_swap_chain(swap_chain) {
        return;
    }
    if panic::catch_unwind(AssertUnwindSafe(|| f(&mut rt.0))).is_err() {
        log_panic("present");
    }
}

pub unsafe extern "system" fn hook_present(
    THIS: *mut IDXGISwapChain,
    SyncInterval: UINT,
    Flags: UINT,
) -> HRESULT {
    let real = match real_present() {
        Some(f) => f,
        None => return S_OK,
    };
    let draw = real_draw_indexed();
    with_engine_present(THIS as usize, |o| {
        o.on_present_pre(|ctx, p| {
            // straight to the original; going through the slot would land back in our hook
            if let Some(draw) = draw {
                draw(ctx.context_ptr(), p.index_count, p.start_index, p.base_vertex);
            }
        })
    });
    let hr = real(THIS, SyncInterval, Flags);
    with_engine_present(THIS as usize, |o| o.on_present_post());
    hr
}

pub unsafe extern "system" fn hook_draw_indexed(
    THIS: *mut ID3D11DeviceContext,
    IndexCount: UINT,
    StartIndexLocation: UINT,
    BaseVertexLocation: INT,
) {
    let real = match real_draw_indexed() {
        Some(f) => f,
        None => return,
    };
    // the lock is held while present is replaying or the init thread is storing state; in
    // either case just forward
    if let Ok(mut guard) = RUNTIME.try_lock() {
        if let Some(rt) = guard.as_mut() {
            let draw = DrawParams {
                index_count: IndexCount,
                start_index: StartIndexLocation,
                base_vertex: BaseVertexLocation,
            };
            if panic::catch_unwind(AssertUnwindSafe(|| rt.0.on_draw_indexed(THIS as usize, draw)))
                .is_err()
            {
                log_panic("draw");
            }
        }
    }
    real(THIS, IndexCount, StartIndexLocation, BaseVertexLocation)
}

pub fn store_runtime(orchestrator: D3D11Orchestrator) -> Result<()> {
    let mut guard = RUNTIME.lock().map_err(|_| HookError::GlobalLockError)?;
    *guard = Some(RenderThreadState(orchestrator));
    Ok(())
}

/// Redirect Present and DrawIndexed.  Permanent: there is no uninstall.
///
/// Each original is published before its slot is written, so a trampoline can always forward.
pub unsafe fn install_hooks(mem: &LocalProcess, swap_chain: usize, context: usize) -> Result<()> {
    if HOOKS.get().is_some() {
        return Err(HookError::HookAlreadyInstalled(PRESENT_SLOT));
    }
    let mut present = VTableHook::new(PRESENT_SLOT, hook_present as usize);
    let mut draw_indexed = VTableHook::new(DRAW_INDEXED_SLOT, hook_draw_indexed as usize);
    hook_slot(&mut present, &REAL_PRESENT, mem, swap_chain)?;
    // with present hooked, a draw hook failure only costs the capture
    if let Err(e) = hook_slot(&mut draw_indexed, &REAL_DRAW_INDEXED, mem, context) {
        error!("DrawIndexed not hooked, HDR capture disabled: {}", e);
    }
    if HOOKS
        .set(InstalledHooks {
            present,
            draw_indexed,
        })
        .is_err()
    {
        return Err(HookError::BadStateError("hook table already set".to_string()));
    }
    info!("d3d11 hooks installed");
    Ok(())
}

/// Process detach.  Reverts the bridge patch and drops what we own.  When the process is
/// exiting the orchestrator is leaked instead, so the context and device are never released
/// into a driver that may already be gone.
pub fn shutdown(process_exiting: bool) {
    let mut guard = match RUNTIME.try_lock() {
        Ok(g) => g,
        Err(_) => return,
    };
    if let Some(mut rt) = guard.take() {
        unsafe { rt.0.shutdown() };
        if process_exiting {
            std::mem::forget(rt);
        }
    }
}
