//! Platform backends.
//!
//! Each submodule implements [`crate::backend::DeviceBackend`] for one
//! operating system and is selected with conditional compilation. The
//! submodules expose the same public API so the rest of the library
//! never branches on the platform itself.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;
