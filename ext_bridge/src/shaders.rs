/// Thread group edge; must match `numthreads` below.
pub const MASK_GROUP_SIZE: u32 = 8;

pub const MASK_CS_ENTRY: &str = "main";

/// Copies the engine's motion vectors into the frame generator's buffer, zeroed wherever the
/// overlay was drawn this frame or last frame.  Zero motion there makes the interpolator take
/// the source frame as is.
pub const MASK_CS_HLSL: &str = r#"
Texture2D<float2> EngineMotionVectors : register(t0);
Texture2D<float> MaskCurrent : register(t1);
Texture2D<float> MaskPrevious : register(t2);
RWTexture2D<float2> SharedMotionVectors : register(u0);

[numthreads(8, 8, 1)]
void main(uint3 id : SV_DispatchThreadID)
{
    uint w, h;
    SharedMotionVectors.GetDimensions(w, h);
    if (id.x >= w || id.y >= h)
        return;

    float covered = max(MaskCurrent[id.xy], MaskPrevious[id.xy]);
    SharedMotionVectors[id.xy] = covered > 0.0 ? float2(0.0, 0.0) : EngineMotionVectors[id.xy];
}
"#;
