//! Injected device capabilities
//!
//! The engine never talks to a device itself. The automation layer that
//! owns the emulator injects these capabilities into
//! [`crate::engine::TextRetriever`] calls.

use anyhow::Result;
use std::path::Path;

/// Captures the current screen into an image file.
pub trait ScreenCapture {
    /// Write a screenshot to `destination` (PNG).
    fn capture(&mut self, destination: &Path) -> Result<()>;
}

/// Sends a tap at a screen coordinate.
pub trait TouchInput {
    fn tap(&mut self, x: u32, y: u32) -> Result<()>;
}
