use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod bus;

pub use bus::{BusError, BusReceiver, LocalBus, MessageBus};

/// Target marker meaning "every listener", as opposed to a specific
/// processor instance id.
pub const BROADCAST: &str = "*";

/// Parameter snapshot keyed by parameter id, values normalized to [0, 1].
pub type ParamMap = HashMap<String, f32>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParamEdit {
    pub param_id: String,
    pub value: f32,
}

/// One telemetry sample for the meter fast path. Individual frames are
/// disposable; losing any number of them is fine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct MeterFrame {
    pub peak_left: f32,
    pub peak_right: f32,
    pub rms_left: f32,
    pub rms_right: f32,
}

/// Everything that crosses the window boundary, in both directions.
///
/// `revision` appears only on the two host->window kinds that convey
/// authoritative state. Window->host edits carry no revision and are applied
/// unconditionally on arrival (last writer wins).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Message {
    RequestInitialState {
        target_id: String,
        plugin_id: String,
        timestamp: u64,
    },
    InitialState {
        target_id: String,
        params: ParamMap,
        bypassed: bool,
        revision: u64,
        timestamp: u64,
    },
    StateUpdate {
        target_id: String,
        params: ParamMap,
        bypassed: bool,
        revision: u64,
        timestamp: u64,
    },
    ParamChange {
        target_id: String,
        param_id: String,
        value: f32,
        timestamp: u64,
    },
    BypassChange {
        target_id: String,
        bypassed: bool,
        timestamp: u64,
    },
    ParamBatch {
        target_id: String,
        changes: Vec<ParamEdit>,
        timestamp: u64,
    },
    ProjectClosed {
        target_id: String,
        timestamp: u64,
    },
    HostReady {
        target_id: String,
        timestamp: u64,
    },
    Ping {
        target_id: String,
        timestamp: u64,
    },
    Pong {
        target_id: String,
        timestamp: u64,
    },
    WindowClosed {
        target_id: String,
        timestamp: u64,
    },
    MeterUpdate {
        target_id: String,
        meter: MeterFrame,
        timestamp: u64,
    },
}

impl Message {
    pub fn target_id(&self) -> &str {
        match self {
            Message::RequestInitialState { target_id, .. }
            | Message::InitialState { target_id, .. }
            | Message::StateUpdate { target_id, .. }
            | Message::ParamChange { target_id, .. }
            | Message::BypassChange { target_id, .. }
            | Message::ParamBatch { target_id, .. }
            | Message::ProjectClosed { target_id, .. }
            | Message::HostReady { target_id, .. }
            | Message::Ping { target_id, .. }
            | Message::Pong { target_id, .. }
            | Message::WindowClosed { target_id, .. }
            | Message::MeterUpdate { target_id, .. } => target_id,
        }
    }

    /// Revision stamped on authoritative host->window state, absent
    /// everywhere else.
    pub fn revision(&self) -> Option<u64> {
        match self {
            Message::InitialState { revision, .. } | Message::StateUpdate { revision, .. } => {
                Some(*revision)
            }
            _ => None,
        }
    }

    /// Direction filter: both ends share one multicast medium, so each end
    /// handles only the kinds flowing toward it and ignores its own echo.
    pub fn is_from_host(&self) -> bool {
        matches!(
            self,
            Message::InitialState { .. }
                | Message::StateUpdate { .. }
                | Message::ProjectClosed { .. }
                | Message::HostReady { .. }
                | Message::Pong { .. }
                | Message::MeterUpdate { .. }
        )
    }

    /// Addressing rule: a specific target id reaches only that listener, the
    /// broadcast marker reaches everyone.
    pub fn is_for(&self, listener_id: &str) -> bool {
        let target = self.target_id();
        target == BROADCAST || target == listener_id
    }
}

/// Wall-clock stamp for outbound messages, unix millis.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
