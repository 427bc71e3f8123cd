//! Two single channel masks marking where the overlay was drawn, one per frame parity.  The
//! compositing shader reads both the current and the previous one, since the interpolated frame
//! sits between them.
//!
//! The overlay pass writes its coverage through `rtv`; the bridge clears through `uav` and the
//! compositing shader reads through `srv`.

use tracing::debug;

use shared_dx::backend::*;
use shared_dx::error::Result;

use crate::layout::other_parity;

pub struct MaskTexture<C: GraphicsContext> {
    pub texture: C::Texture,
    pub srv: C::ShaderResourceView,
    pub uav: C::UnorderedAccessView,
    pub rtv: C::RenderTargetView,
}

pub struct MaskDoubleBuffer<C: GraphicsContext> {
    masks: [MaskTexture<C>; 2],
    width: u32,
    height: u32,
}

impl<C: GraphicsContext> MaskDoubleBuffer<C> {
    pub fn create(ctx: &C, width: u32, height: u32) -> Result<Self> {
        let make = || -> Result<MaskTexture<C>> {
            let info = TextureInfo::new_2d(width, height, FORMAT_R8_UNORM);
            let bind = BIND_SHADER_RESOURCE | BIND_UNORDERED_ACCESS | BIND_RENDER_TARGET;
            let texture = ctx.create_texture(&info, bind)?;
            let srv = ctx.create_shader_resource_view(&texture, None)?;
            let uav = ctx.create_unordered_access_view(&texture)?;
            let rtv = ctx.create_render_target_view(&texture)?;
            Ok(MaskTexture {
                texture,
                srv,
                uav,
                rtv,
            })
        };
        let masks = [make()?, make()?];
        debug!("created mask double buffer {}x{}", width, height);
        Ok(Self {
            masks,
            width,
            height,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn current(&self, parity: usize) -> &MaskTexture<C> {
        &self.masks[parity & 1]
    }

    pub fn previous(&self, parity: usize) -> &MaskTexture<C> {
        &self.masks[other_parity(parity)]
    }

    pub fn clear(&self, ctx: &C, parity: usize) {
        ctx.clear_unordered_access_view(&self.current(parity).uav, [0.0; 4]);
    }
}

/// Keep `slot` holding masks of `width`x`height`, recreating them when the size changes.  On
/// failure the slot is left empty.
pub fn ensure_mask<C: GraphicsContext>(
    slot: &mut Option<MaskDoubleBuffer<C>>,
    ctx: &C,
    width: u32,
    height: u32,
) -> Result<()> {
    if let Some(m) = slot.as_ref() {
        if m.size() == (width, height) {
            return Ok(());
        }
    }
    *slot = None;
    *slot = Some(MaskDoubleBuffer::create(ctx, width, height)?);
    Ok(())
}
