mod client;

pub use client::{
    ConnectionState, PendingEdit, WindowClient, WindowDelegate, HEARTBEAT_INTERVAL, PONG_TIMEOUT,
};
