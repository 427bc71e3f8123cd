pub mod memory;
#[cfg(windows)]
pub mod util;

#[cfg(any(test, feature = "mock"))]
pub mod mock_memory;
