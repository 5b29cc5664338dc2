mod geometry;
mod registry;
mod windows;

pub use geometry::{EditorSize, ScreenBounds, SizePrefs, WindowRect};
pub use registry::{
    EditObserver, HostError, ObserverId, OpenOutcome, SessionRegistry, StateProvider, TargetState,
};
pub use windows::{PopupBlocked, TrackedWindow, WindowHandle, WindowPlatform};
