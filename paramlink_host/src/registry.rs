use crate::geometry::{self, SizePrefs, WindowRect};
use crate::windows::{TrackedWindow, WindowPlatform};
use paramlink_protocol::{
    now_millis, BusError, BusReceiver, Message, MessageBus, MeterFrame, ParamEdit, ParamMap,
    BROADCAST,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Authoritative snapshot for one target, as returned by the state provider.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetState {
    pub params: ParamMap,
    pub bypassed: bool,
}

/// Supplies current authoritative state for a target, or `None` when the
/// target no longer exists (orphaned-window case). Exactly one provider is
/// active at a time; registering a new one replaces the previous.
pub type StateProvider = Box<dyn FnMut(&str) -> Option<TargetState>>;

/// Consumer of edits arriving from editor windows. Edits carry no revision
/// and are forwarded unconditionally in arrival order (last writer wins).
pub trait EditObserver {
    fn on_param_change(&mut self, target_id: &str, param_id: &str, value: f32);
    fn on_bypass_change(&mut self, target_id: &str, bypassed: bool);
    fn on_param_batch(&mut self, target_id: &str, changes: &[ParamEdit]) {
        for edit in changes {
            self.on_param_change(target_id, &edit.param_id, edit.value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new window was created and tracked.
    Opened,
    /// A live window already existed; it was brought to the foreground.
    Focused,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("window creation blocked by the platform for {target_id}")]
    PopupBlocked { target_id: String },
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Process-wide authority for editor windows: liveness tracking, the global
/// revision counter, and the pluggable state/edit callbacks.
///
/// Constructed once at application start and reset on project switch via
/// [`SessionRegistry::close_all_windows`]; collaborators receive it by
/// reference rather than through ambient global state.
pub struct SessionRegistry {
    bus: Arc<dyn MessageBus>,
    rx: BusReceiver,
    platform: Box<dyn WindowPlatform>,
    prefs: SizePrefs,
    windows: HashMap<String, TrackedWindow>,
    /// Global across all targets: every outbound INITIAL_STATE/STATE_UPDATE,
    /// for any target, consumes the next integer. Clients then need only a
    /// single `>` comparison and no per-target epochs.
    revision: u64,
    provider: Option<StateProvider>,
    observers: Vec<(ObserverId, Box<dyn EditObserver>)>,
    next_observer: u64,
    blocked: Vec<String>,
}

impl SessionRegistry {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        platform: Box<dyn WindowPlatform>,
        prefs: SizePrefs,
    ) -> Self {
        let rx = bus.subscribe();
        Self {
            bus,
            rx,
            platform,
            prefs,
            windows: HashMap::new(),
            revision: 0,
            provider: None,
            observers: Vec::new(),
            next_observer: 0,
            blocked: Vec::new(),
        }
    }

    pub fn set_state_provider<F>(&mut self, provider: F)
    where
        F: FnMut(&str) -> Option<TargetState> + 'static,
    {
        self.provider = Some(Box::new(provider));
    }

    pub fn subscribe_edits(&mut self, observer: Box<dyn EditObserver>) -> ObserverId {
        self.next_observer += 1;
        let id = ObserverId(self.next_observer);
        self.observers.push((id, observer));
        id
    }

    pub fn unsubscribe_edits(&mut self, id: ObserverId) {
        self.observers.retain(|(oid, _)| *oid != id);
    }

    /// Announce (re)initialization so editor windows surviving from a
    /// previous host session re-request their state.
    pub fn announce_ready(&self) -> Result<(), HostError> {
        self.bus.publish(&Message::HostReady {
            target_id: BROADCAST.to_string(),
            timestamp: now_millis(),
        })?;
        Ok(())
    }

    /// Open an editor window for `target_id`, or focus the one already open.
    /// Never spawns a duplicate: at most one tracked window exists per
    /// target at any time.
    pub fn open_window(
        &mut self,
        target_id: &str,
        plugin_id: &str,
    ) -> Result<OpenOutcome, HostError> {
        if let Some(tracked) = self.windows.get(target_id) {
            if let Some(handle) = tracked.live_handle() {
                handle.focus();
                return Ok(OpenOutcome::Focused);
            }
            // The window died without a WINDOW_CLOSED reaching us; evict the
            // stale entry and open fresh.
            self.windows.remove(target_id);
        }

        let dims = geometry::resolve(plugin_id, &self.prefs);
        let rect = WindowRect::centered(dims, self.platform.screen());
        match self.platform.open(target_id, rect) {
            Ok(handle) => {
                self.blocked.retain(|t| t != target_id);
                self.windows.insert(
                    target_id.to_string(),
                    TrackedWindow {
                        plugin_id: plugin_id.to_string(),
                        handle: Arc::downgrade(&handle),
                        last_sent_revision: 0,
                    },
                );
                Ok(OpenOutcome::Opened)
            }
            Err(_) => {
                log::warn!("window creation blocked for {target_id}");
                if !self.blocked.iter().any(|t| t == target_id) {
                    self.blocked.push(target_id.to_string());
                }
                Err(HostError::PopupBlocked {
                    target_id: target_id.to_string(),
                })
            }
        }
    }

    pub fn close_window(&mut self, target_id: &str) {
        if let Some(tracked) = self.windows.remove(target_id) {
            if let Some(handle) = tracked.handle.upgrade() {
                handle.close();
            }
        }
    }

    /// Project switch: broadcast PROJECT_CLOSED so every client stops
    /// editing, then force-close and untrack everything. No stale window can
    /// keep editing torn-down state afterwards.
    pub fn close_all_windows(&mut self) -> Result<(), HostError> {
        self.bus.publish(&Message::ProjectClosed {
            target_id: BROADCAST.to_string(),
            timestamp: now_millis(),
        })?;
        for (_, tracked) in self.windows.drain() {
            if let Some(handle) = tracked.handle.upgrade() {
                handle.close();
            }
        }
        self.blocked.clear();
        Ok(())
    }

    pub fn is_window_open(&self, target_id: &str) -> bool {
        self.windows
            .get(target_id)
            .is_some_and(|t| t.live_handle().is_some())
    }

    pub fn tracked_count(&self) -> usize {
        self.windows.len()
    }

    /// Plugin identity a tracked window was opened with, for UI labeling.
    pub fn plugin_for(&self, target_id: &str) -> Option<&str> {
        self.windows.get(target_id).map(|t| t.plugin_id.as_str())
    }

    /// Targets whose window creation was refused, for the UI to explain.
    pub fn blocked_targets(&self) -> &[String] {
        &self.blocked
    }

    pub fn dismiss_blocked(&mut self, target_id: &str) {
        self.blocked.retain(|t| t != target_id);
    }

    /// Best-effort keep-on-top: the platform offers no persistent
    /// always-on-top across independent windows, so the host calls this
    /// whenever its own window gains input focus.
    pub fn host_focus_gained(&self) {
        for tracked in self.windows.values() {
            if let Some(handle) = tracked.live_handle() {
                handle.focus();
            }
        }
    }

    /// Push authoritative state to a window after it changed through any
    /// path other than that window's own edits (undo, automation, another
    /// editing surface). Bumping the revision, stamping the tracked window
    /// and publishing is one atomic step.
    pub fn send_state_update(
        &mut self,
        target_id: &str,
        params: ParamMap,
        bypassed: bool,
    ) -> Result<(), HostError> {
        let Some(tracked) = self.windows.get_mut(target_id) else {
            log::debug!("no tracked window for {target_id}, dropping state update");
            return Ok(());
        };
        self.revision += 1;
        tracked.last_sent_revision = self.revision;
        self.bus.publish(&Message::StateUpdate {
            target_id: target_id.to_string(),
            params,
            bypassed,
            revision: self.revision,
            timestamp: now_millis(),
        })?;
        Ok(())
    }

    /// Telemetry fast path. Dropped at the source when no live window is
    /// tracked for the target, so a closed editor produces no channel
    /// traffic at all.
    pub fn send_meter_update(&self, target_id: &str, meter: MeterFrame) -> Result<(), HostError> {
        if !self.is_window_open(target_id) {
            log::debug!("no open window for {target_id}, dropping meter frame");
            return Ok(());
        }
        self.bus.publish(&Message::MeterUpdate {
            target_id: target_id.to_string(),
            meter,
            timestamp: now_millis(),
        })?;
        Ok(())
    }

    /// Drain and dispatch every pending inbound message. Host->window kinds
    /// echoed back by the multicast medium are ignored; foreign or malformed
    /// traffic never fails the loop.
    pub fn pump(&mut self) {
        while let Some(msg) = self.rx.try_recv() {
            if msg.is_from_host() {
                continue;
            }
            self.dispatch(msg);
        }
    }

    fn dispatch(&mut self, msg: Message) {
        match msg {
            Message::RequestInitialState { target_id, .. } => {
                self.reply_initial_state(&target_id);
            }
            Message::ParamChange {
                target_id,
                param_id,
                value,
                ..
            } => {
                for (_, observer) in &mut self.observers {
                    observer.on_param_change(&target_id, &param_id, value);
                }
            }
            Message::BypassChange {
                target_id, bypassed, ..
            } => {
                for (_, observer) in &mut self.observers {
                    observer.on_bypass_change(&target_id, bypassed);
                }
            }
            Message::ParamBatch {
                target_id, changes, ..
            } => {
                for (_, observer) in &mut self.observers {
                    observer.on_param_batch(&target_id, &changes);
                }
            }
            Message::Ping { target_id, .. } => {
                self.send(Message::Pong {
                    target_id,
                    timestamp: now_millis(),
                });
            }
            Message::WindowClosed { target_id, .. } => {
                self.windows.remove(&target_id);
            }
            _ => {}
        }
    }

    fn reply_initial_state(&mut self, target_id: &str) {
        let state = self.provider.as_mut().and_then(|p| p(target_id));
        match state {
            Some(TargetState { params, bypassed }) => {
                self.revision += 1;
                if let Some(tracked) = self.windows.get_mut(target_id) {
                    tracked.last_sent_revision = self.revision;
                }
                self.send(Message::InitialState {
                    target_id: target_id.to_string(),
                    params,
                    bypassed,
                    revision: self.revision,
                    timestamp: now_millis(),
                });
            }
            None => {
                // Orphaned window: the target no longer resolves to live
                // state. Tell it so it self-disposes instead of hanging.
                log::debug!("no state for {target_id}, replying project_closed");
                self.send(Message::ProjectClosed {
                    target_id: target_id.to_string(),
                    timestamp: now_millis(),
                });
            }
        }
    }

    fn send(&self, msg: Message) {
        if let Err(e) = self.bus.publish(&msg) {
            log::warn!("publish failed: {e}");
        }
    }
}
