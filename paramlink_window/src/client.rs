use paramlink_protocol::{
    now_millis, BusReceiver, Message, MessageBus, MeterFrame, ParamEdit, ParamMap,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fixed heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// No PONG for this long (2.5x the heartbeat interval) means the host is
/// gone. The transport offers no delivery confirmation, so this is the only
/// liveness signal available.
pub const PONG_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// Terminal for editing: the target no longer exists in the host. The
    /// window should close itself.
    ProjectClosed,
}

/// Edit captured while the host was unreachable. Drained FIFO, in full, the
/// moment the client adopts a fresh INITIAL_STATE.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingEdit {
    Param { param_id: String, value: f32 },
    Bypass { bypassed: bool },
    /// A batch stays one entry so the flush cannot interleave it with a
    /// concurrent host push.
    Batch(Vec<ParamEdit>),
}

/// Surface the editor window implements: parameter rendering, the
/// connection badge, and meters.
pub trait WindowDelegate {
    fn on_state_update(&mut self, params: &ParamMap, bypassed: bool);
    fn on_connection_change(&mut self, state: ConnectionState);
    fn on_meter_update(&mut self, _meter: &MeterFrame) {}
}

/// Per-editor-window state machine mirroring one target against the host.
///
/// Cooperative: the owner calls [`WindowClient::pump`] from its event loop;
/// nothing here blocks or spawns. Edits issued before the first
/// INITIAL_STATE or while disconnected are queued, never dropped.
pub struct WindowClient<D: WindowDelegate> {
    target_id: String,
    plugin_id: String,
    bus: Arc<dyn MessageBus>,
    rx: BusReceiver,
    delegate: D,
    state: ConnectionState,
    /// Set once the first INITIAL_STATE has been adopted. Until then the
    /// handshake gate holds: nothing is sent live, whatever the heartbeat
    /// says about host liveness.
    has_baseline: bool,
    last_applied_revision: u64,
    pending: VecDeque<PendingEdit>,
    last_pong: Instant,
    last_ping: Option<Instant>,
    closed: bool,
}

impl<D: WindowDelegate> WindowClient<D> {
    /// Mount: announce `Connecting`, request the initial snapshot, arm the
    /// heartbeat.
    pub fn new(
        target_id: &str,
        plugin_id: &str,
        bus: Arc<dyn MessageBus>,
        mut delegate: D,
        now: Instant,
    ) -> Self {
        let rx = bus.subscribe();
        delegate.on_connection_change(ConnectionState::Connecting);
        let client = Self {
            target_id: target_id.to_string(),
            plugin_id: plugin_id.to_string(),
            bus,
            rx,
            delegate,
            state: ConnectionState::Connecting,
            has_baseline: false,
            last_applied_revision: 0,
            pending: VecDeque::new(),
            last_pong: now,
            last_ping: None,
            closed: false,
        };
        client.request_initial_state();
        client
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_applied_revision(&self) -> u64 {
        self.last_applied_revision
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_editable(&self) -> bool {
        self.state != ConnectionState::ProjectClosed
    }

    /// Drain inbound traffic addressed to this window, then run the
    /// heartbeat step. Call on every event-loop tick.
    pub fn pump(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        while let Some(msg) = self.rx.try_recv() {
            if !msg.is_from_host() || !msg.is_for(&self.target_id) {
                continue;
            }
            self.handle(msg, now);
        }
        self.heartbeat(now);
    }

    /// User edit of a single parameter. Unbatched when live; queued while
    /// the handshake is outstanding or the host is unreachable.
    pub fn set_param(&mut self, param_id: &str, value: f32) {
        match self.state {
            ConnectionState::Connected => self.send(Message::ParamChange {
                target_id: self.target_id.clone(),
                param_id: param_id.to_string(),
                value,
                timestamp: now_millis(),
            }),
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                self.pending.push_back(PendingEdit::Param {
                    param_id: param_id.to_string(),
                    value,
                });
            }
            ConnectionState::ProjectClosed => {
                log::debug!("dropping edit for {}: project closed", self.target_id);
            }
        }
    }

    pub fn set_bypassed(&mut self, bypassed: bool) {
        match self.state {
            ConnectionState::Connected => self.send(Message::BypassChange {
                target_id: self.target_id.clone(),
                bypassed,
                timestamp: now_millis(),
            }),
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                self.pending.push_back(PendingEdit::Bypass { bypassed });
            }
            ConnectionState::ProjectClosed => {
                log::debug!("dropping edit for {}: project closed", self.target_id);
            }
        }
    }

    /// Atomic multi-field edit, e.g. loading a preset, so a concurrent host
    /// push cannot interleave with it.
    pub fn set_param_batch(&mut self, changes: Vec<ParamEdit>) {
        match self.state {
            ConnectionState::Connected => self.send(Message::ParamBatch {
                target_id: self.target_id.clone(),
                changes,
                timestamp: now_millis(),
            }),
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                self.pending.push_back(PendingEdit::Batch(changes));
            }
            ConnectionState::ProjectClosed => {
                log::debug!("dropping edit for {}: project closed", self.target_id);
            }
        }
    }

    /// Teardown: best-effort close notice, heartbeat stopped. Also runs on
    /// drop, so a forgotten window cannot keep a timer firing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.send(Message::WindowClosed {
            target_id: self.target_id.clone(),
            timestamp: now_millis(),
        });
    }

    fn handle(&mut self, msg: Message, now: Instant) {
        if self.state == ConnectionState::ProjectClosed {
            return;
        }
        match msg {
            Message::InitialState {
                params,
                bypassed,
                revision,
                ..
            } => {
                // This message always wins: adopt the carried revision as
                // the new baseline even if it is lower than what we saw.
                self.has_baseline = true;
                self.last_applied_revision = revision;
                self.delegate.on_state_update(&params, bypassed);
                self.last_pong = now;
                self.set_state(ConnectionState::Connected);
                self.flush_pending();
            }
            Message::StateUpdate {
                params,
                bypassed,
                revision,
                ..
            } => {
                if revision > self.last_applied_revision {
                    self.last_applied_revision = revision;
                    self.delegate.on_state_update(&params, bypassed);
                } else {
                    log::debug!(
                        "discarding stale update for {} (revision {revision} <= {})",
                        self.target_id,
                        self.last_applied_revision
                    );
                }
            }
            Message::ProjectClosed { .. } => {
                self.pending.clear();
                self.set_state(ConnectionState::ProjectClosed);
            }
            Message::Pong { .. } => {
                self.last_pong = now;
                if self.state == ConnectionState::Disconnected {
                    if self.has_baseline {
                        self.set_state(ConnectionState::Connected);
                    } else {
                        // The host is alive but we never adopted a snapshot
                        // (the timeout hit while still connecting). Stay
                        // gated and renegotiate; INITIAL_STATE will connect
                        // us and flush the queue in one step.
                        self.request_initial_state();
                    }
                }
            }
            Message::HostReady { .. } => {
                // Host restarted while this window survived; it has no
                // memory of us, so renegotiate from scratch.
                self.request_initial_state();
            }
            Message::MeterUpdate { meter, .. } => {
                self.delegate.on_meter_update(&meter);
            }
            _ => {}
        }
    }

    fn heartbeat(&mut self, now: Instant) {
        if self.state == ConnectionState::ProjectClosed {
            return;
        }
        let ping_due = self
            .last_ping
            .map_or(true, |t| now.saturating_duration_since(t) >= HEARTBEAT_INTERVAL);
        if ping_due {
            self.send(Message::Ping {
                target_id: self.target_id.clone(),
                timestamp: now_millis(),
            });
            self.last_ping = Some(now);
        }
        if now.saturating_duration_since(self.last_pong) > PONG_TIMEOUT
            && self.state != ConnectionState::Disconnected
        {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn flush_pending(&mut self) {
        while let Some(edit) = self.pending.pop_front() {
            let msg = match edit {
                PendingEdit::Param { param_id, value } => Message::ParamChange {
                    target_id: self.target_id.clone(),
                    param_id,
                    value,
                    timestamp: now_millis(),
                },
                PendingEdit::Bypass { bypassed } => Message::BypassChange {
                    target_id: self.target_id.clone(),
                    bypassed,
                    timestamp: now_millis(),
                },
                PendingEdit::Batch(changes) => Message::ParamBatch {
                    target_id: self.target_id.clone(),
                    changes,
                    timestamp: now_millis(),
                },
            };
            self.send(msg);
        }
    }

    fn request_initial_state(&self) {
        self.send(Message::RequestInitialState {
            target_id: self.target_id.clone(),
            plugin_id: self.plugin_id.clone(),
            timestamp: now_millis(),
        });
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.delegate.on_connection_change(state);
        }
    }

    fn send(&self, msg: Message) {
        if let Err(e) = self.bus.publish(&msg) {
            log::warn!("publish failed for {}: {e}", self.target_id);
        }
    }
}

impl<D: WindowDelegate> Drop for WindowClient<D> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paramlink_protocol::LocalBus;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, PartialEq)]
    enum Event {
        State(ConnectionState),
        Applied(ParamMap, bool),
        Meter,
    }

    struct Recording {
        events: Rc<RefCell<Vec<Event>>>,
    }

    impl WindowDelegate for Recording {
        fn on_state_update(&mut self, params: &ParamMap, bypassed: bool) {
            self.events
                .borrow_mut()
                .push(Event::Applied(params.clone(), bypassed));
        }
        fn on_connection_change(&mut self, state: ConnectionState) {
            self.events.borrow_mut().push(Event::State(state));
        }
        fn on_meter_update(&mut self, _meter: &MeterFrame) {
            self.events.borrow_mut().push(Event::Meter);
        }
    }

    fn setup() -> (
        Arc<LocalBus>,
        WindowClient<Recording>,
        Rc<RefCell<Vec<Event>>>,
        Instant,
    ) {
        let bus = Arc::new(LocalBus::new());
        let events = Rc::new(RefCell::new(Vec::new()));
        let t0 = Instant::now();
        let client = WindowClient::new(
            "ins-1",
            "eq.para-8",
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            Recording {
                events: Rc::clone(&events),
            },
            t0,
        );
        (bus, client, events, t0)
    }

    fn params(pairs: &[(&str, f32)]) -> ParamMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn initial_state(revision: u64, pairs: &[(&str, f32)]) -> Message {
        Message::InitialState {
            target_id: "ins-1".to_string(),
            params: params(pairs),
            bypassed: false,
            revision,
            timestamp: 0,
        }
    }

    fn state_update(revision: u64, pairs: &[(&str, f32)]) -> Message {
        Message::StateUpdate {
            target_id: "ins-1".to_string(),
            params: params(pairs),
            bypassed: false,
            revision,
            timestamp: 0,
        }
    }

    #[test]
    fn edits_before_handshake_are_queued_then_flushed_fifo() {
        let (bus, mut client, _events, t0) = setup();
        let tap = bus.subscribe();

        client.set_param("gain", 0.3);
        client.set_bypassed(true);
        assert_eq!(client.pending_len(), 2);

        // Nothing live was sent while connecting.
        client.pump(t0);
        while let Some(msg) = tap.try_recv() {
            assert!(
                !matches!(msg, Message::ParamChange { .. } | Message::BypassChange { .. }),
                "edit leaked before handshake: {msg:?}"
            );
        }

        bus.publish(&initial_state(1, &[("gain", 0.5)])).unwrap();
        client.pump(t0);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.pending_len(), 0);

        let mut flushed = Vec::new();
        while let Some(msg) = tap.try_recv() {
            match msg {
                Message::ParamChange { param_id, .. } => flushed.push(param_id),
                Message::BypassChange { .. } => flushed.push("bypass".to_string()),
                _ => {}
            }
        }
        assert_eq!(flushed, ["gain", "bypass"]);
    }

    #[test]
    fn out_of_order_updates_keep_highest_revision_payload() {
        let (bus, mut client, events, t0) = setup();

        bus.publish(&initial_state(1, &[("gain", 0.5)])).unwrap();
        bus.publish(&state_update(3, &[("gain", 0.9)])).unwrap();
        bus.publish(&state_update(2, &[("gain", 0.7)])).unwrap();
        client.pump(t0);

        assert_eq!(client.last_applied_revision(), 3);
        let applied: Vec<_> = events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Applied(p, _) => p.get("gain").copied(),
                _ => None,
            })
            .collect();
        assert_eq!(applied, [0.5, 0.9]);
    }

    #[test]
    fn duplicate_redelivery_is_harmless() {
        let (bus, mut client, events, t0) = setup();

        bus.publish(&initial_state(1, &[("gain", 0.5)])).unwrap();
        bus.publish(&state_update(2, &[("gain", 0.8)])).unwrap();
        client.pump(t0);
        bus.publish(&state_update(1, &[("gain", 0.5)])).unwrap();
        client.pump(t0);

        assert_eq!(client.last_applied_revision(), 2);
        let applied = events
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::Applied(..)))
            .count();
        assert_eq!(applied, 2);
    }

    #[test]
    fn initial_state_always_resets_the_baseline() {
        let (bus, mut client, events, t0) = setup();

        bus.publish(&initial_state(5, &[("gain", 0.5)])).unwrap();
        client.pump(t0);
        bus.publish(&initial_state(2, &[("gain", 0.1)])).unwrap();
        client.pump(t0);

        assert_eq!(client.last_applied_revision(), 2);
        match events.borrow().last() {
            Some(Event::Applied(p, _)) => assert_eq!(p.get("gain"), Some(&0.1)),
            other => panic!("expected applied state, got {other:?}"),
        };
    }

    #[test]
    fn heartbeat_timeout_disconnects_and_pong_recovers() {
        let (bus, mut client, _events, t0) = setup();

        bus.publish(&initial_state(1, &[])).unwrap();
        client.pump(t0);
        assert_eq!(client.state(), ConnectionState::Connected);

        client.pump(t0 + Duration::from_secs(6));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        bus.publish(&Message::Pong {
            target_id: "ins-1".to_string(),
            timestamp: 0,
        })
        .unwrap();
        client.pump(t0 + Duration::from_secs(7));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn pong_without_a_baseline_stays_gated_and_renegotiates() {
        let (bus, mut client, _events, t0) = setup();

        // Timeout fires before any INITIAL_STATE was ever adopted.
        client.set_param("gain", 0.1);
        client.pump(t0 + Duration::from_secs(6));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let tap = bus.subscribe();
        bus.publish(&Message::Pong {
            target_id: "ins-1".to_string(),
            timestamp: 0,
        })
        .unwrap();
        client.pump(t0 + Duration::from_secs(7));

        // A lone PONG proves the host is alive, not that we hold current
        // state: the gate must hold and the snapshot be re-requested.
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let mut rerequested = false;
        while let Some(msg) = tap.try_recv() {
            match msg {
                Message::RequestInitialState { .. } => rerequested = true,
                Message::ParamChange { .. } | Message::BypassChange { .. } => {
                    panic!("edit leaked before first baseline: {msg:?}")
                }
                _ => {}
            }
        }
        assert!(rerequested);

        // New edits keep queueing behind the old one, so the eventual flush
        // preserves submission order under last-writer-wins.
        client.set_param("gain", 0.9);
        assert_eq!(client.pending_len(), 2);

        bus.publish(&initial_state(1, &[("gain", 0.5)])).unwrap();
        client.pump(t0 + Duration::from_secs(7));
        assert_eq!(client.state(), ConnectionState::Connected);

        let mut flushed = Vec::new();
        while let Some(msg) = tap.try_recv() {
            if let Message::ParamChange { value, .. } = msg {
                flushed.push(value);
            }
        }
        assert_eq!(flushed, [0.1, 0.9]);
    }

    #[test]
    fn offline_batch_flushes_as_one_unsplit_message() {
        let (bus, mut client, _events, t0) = setup();
        let tap = bus.subscribe();

        client.set_param("gain", 0.2);
        client.set_param_batch(vec![
            ParamEdit {
                param_id: "attack".to_string(),
                value: 0.1,
            },
            ParamEdit {
                param_id: "release".to_string(),
                value: 0.6,
            },
        ]);
        assert_eq!(client.pending_len(), 2);

        bus.publish(&initial_state(1, &[])).unwrap();
        client.pump(t0);

        let mut flushed = Vec::new();
        while let Some(msg) = tap.try_recv() {
            match msg {
                Message::ParamChange { param_id, .. } => flushed.push(param_id),
                Message::ParamBatch { changes, .. } => {
                    let ids: Vec<_> = changes.iter().map(|c| c.param_id.clone()).collect();
                    assert_eq!(ids, ["attack", "release"]);
                    flushed.push("batch".to_string());
                }
                _ => {}
            }
        }
        assert_eq!(flushed, ["gain", "batch"]);
    }

    #[test]
    fn offline_edits_are_never_flushed_while_disconnected() {
        let (bus, mut client, _events, t0) = setup();
        bus.publish(&initial_state(1, &[])).unwrap();
        client.pump(t0);

        client.pump(t0 + Duration::from_secs(6));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let tap = bus.subscribe();
        client.set_param("gain", 0.4);
        client.pump(t0 + Duration::from_secs(8));
        assert_eq!(client.pending_len(), 1);
        while let Some(msg) = tap.try_recv() {
            assert!(
                !matches!(msg, Message::ParamChange { .. }),
                "edit leaked while disconnected"
            );
        }
    }

    #[test]
    fn project_closed_is_terminal_for_editing() {
        let (bus, mut client, events, t0) = setup();

        client.set_param("gain", 0.2);
        bus.publish(&Message::ProjectClosed {
            target_id: "ins-1".to_string(),
            timestamp: 0,
        })
        .unwrap();
        client.pump(t0);
        assert_eq!(client.state(), ConnectionState::ProjectClosed);
        assert!(!client.is_editable());
        assert_eq!(client.pending_len(), 0);

        // A late INITIAL_STATE must not resurrect the session.
        bus.publish(&initial_state(9, &[("gain", 1.0)])).unwrap();
        client.set_param("gain", 0.6);
        client.pump(t0);
        assert_eq!(client.state(), ConnectionState::ProjectClosed);
        assert!(!events
            .borrow()
            .iter()
            .any(|e| matches!(e, Event::Applied(..))));
    }

    #[test]
    fn messages_for_other_targets_are_ignored() {
        let (bus, mut client, _events, t0) = setup();

        bus.publish(&Message::InitialState {
            target_id: "ins-2".to_string(),
            params: params(&[("gain", 0.9)]),
            bypassed: false,
            revision: 4,
            timestamp: 0,
        })
        .unwrap();
        client.pump(t0);
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_eq!(client.last_applied_revision(), 0);
    }

    #[test]
    fn close_sends_a_single_window_closed_notice() {
        let (bus, mut client, _events, _t0) = setup();
        let tap = bus.subscribe();

        client.close();
        drop(client);

        let mut notices = 0;
        while let Some(msg) = tap.try_recv() {
            if matches!(msg, Message::WindowClosed { .. }) {
                notices += 1;
            }
        }
        assert_eq!(notices, 1);
    }

    #[test]
    fn meter_frames_reach_the_delegate_without_touching_revisions() {
        let (bus, mut client, events, t0) = setup();

        bus.publish(&Message::MeterUpdate {
            target_id: "ins-1".to_string(),
            meter: MeterFrame {
                peak_left: 0.8,
                peak_right: 0.7,
                rms_left: 0.3,
                rms_right: 0.3,
            },
            timestamp: 0,
        })
        .unwrap();
        client.pump(t0);

        assert!(events.borrow().iter().any(|e| matches!(e, Event::Meter)));
        assert_eq!(client.last_applied_revision(), 0);
    }
}
