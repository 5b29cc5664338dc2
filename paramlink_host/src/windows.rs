use crate::geometry::{ScreenBounds, WindowRect};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// The platform refused to create the window (popup blocked).
#[derive(Debug, Error)]
#[error("window creation refused by the platform")]
pub struct PopupBlocked;

/// Back-reference to a live editor window. The registry only ever focuses or
/// closes through it; it never keeps the window alive (it holds a `Weak`).
pub trait WindowHandle {
    fn focus(&self);
    fn close(&self);
    /// True once the user has closed the window, even if the handle itself
    /// is still reachable.
    fn is_closed(&self) -> bool;
}

/// Seam over the windowing platform so the registry stays testable and
/// platform-agnostic.
pub trait WindowPlatform {
    fn open(
        &mut self,
        target_id: &str,
        rect: WindowRect,
    ) -> Result<Arc<dyn WindowHandle>, PopupBlocked>;

    /// Available screen area editor windows get centered on.
    fn screen(&self) -> ScreenBounds;
}

/// Host-side bookkeeping for one open editor window. At most one exists per
/// target id at any time.
pub struct TrackedWindow {
    pub plugin_id: String,
    pub handle: Weak<dyn WindowHandle>,
    pub last_sent_revision: u64,
}

impl TrackedWindow {
    /// Live means the platform window still exists and the user has not
    /// closed it.
    pub fn live_handle(&self) -> Option<Arc<dyn WindowHandle>> {
        self.handle.upgrade().filter(|h| !h.is_closed())
    }
}
