//! Capture channels
//!
//! Each channel owns one buffer and one retention policy, intercepts a page
//! entry point through an [`InterceptionAdapter`], and publishes every entry
//! it records on the shared [`EventBus`](crate::bus::EventBus).

pub mod console;
pub mod dom;
pub mod network;
pub mod replay;

pub use console::ConsoleChannel;
pub use dom::DomChannel;
pub use network::NetworkChannel;
pub use replay::{FrameCallback, ReplayChannel, ReplayRecorder, StopHandle};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::host::{GlobalSlot, PageEnvironment};

/// Install/uninstall lifecycle shared by every channel that patches the page.
///
/// `install` reads the page's current entry point as the *original*, puts a
/// wrapper in its place and registers any listeners. `uninstall` undoes that.
pub trait InterceptionAdapter: Send + Sync {
    /// Short channel name used in logs and errors
    fn name(&self) -> &'static str;

    /// Wrap the page's entry points. Fails if already installed.
    fn install(&self, page: &Arc<PageEnvironment>) -> Result<()>;

    /// Restore the originals captured at install time. Fails if not installed.
    fn uninstall(&self) -> Result<()>;

    fn is_installed(&self) -> bool;
}

impl std::fmt::Debug for dyn InterceptionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionAdapter")
            .field("name", &self.name())
            .field("installed", &self.is_installed())
            .finish()
    }
}

/// A wrapper placed in a [`GlobalSlot`] together with what it replaced
pub(crate) struct Patch<T: ?Sized> {
    pub original: Arc<T>,
    pub wrapper: Arc<T>,
    pub active: Arc<AtomicBool>,
}

impl<T: ?Sized> Patch<T> {
    /// Build a wrapper around the slot's current value and swap it in
    pub fn apply(
        slot: &GlobalSlot<T>,
        active: Arc<AtomicBool>,
        wrap: impl FnOnce(Arc<T>) -> Arc<T>,
    ) -> Self {
        let original = slot.get();
        let wrapper = wrap(original.clone());
        slot.replace(wrapper.clone());
        Self {
            original,
            wrapper,
            active,
        }
    }

    /// Put the original back if the slot still holds our wrapper.
    ///
    /// When something else wrapped us in the meantime the slot is left alone
    /// and the wrapper is switched to plain forwarding instead.
    pub fn restore(&self, slot: &GlobalSlot<T>) {
        self.active.store(false, Ordering::Release);
        if slot.is(&self.wrapper) {
            slot.replace(self.original.clone());
        } else {
            tracing::debug!("entry point was re-wrapped; leaving forwarding wrapper in place");
        }
    }
}
