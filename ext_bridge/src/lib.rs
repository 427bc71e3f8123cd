/*!
 * Drives a third-party frame generation module that happens to be loaded in the same process.
 *
 * That module has no API for us.  We know where its interop state lives (for one build), patch
 * one branch in its code so it stops copying its input buffers before we have drawn into them,
 * and each frame write the motion vectors it consumes ourselves, with our scope overlay masked
 * out so it doesn't try to interpolate across it.
*/

pub mod bridge;
pub mod layout;
pub mod mask;
pub mod shaders;

pub use crate::bridge::{
    BridgeState, BridgeStats, EngineFrame, ExecuteOutcome, ExternalModuleBridge, SkipReason,
    Transfer,
};
pub use crate::layout::ForeignLayout;
