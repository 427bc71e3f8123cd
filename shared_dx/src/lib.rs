/*!
 * Types shared by every crate in the workspace: the error taxonomy, logging setup, and the
 * `GraphicsContext` seam that the state cache and the bridge are written against.
 *
 * The D3D11 implementation of that seam only exists on Windows.  `MockContext` (feature `mock`)
 * implements it in plain Rust so the hard parts can be tested anywhere.
*/
#![allow(non_snake_case)]

pub mod backend;
pub mod error;
pub mod util;

#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod defs_dx11;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
