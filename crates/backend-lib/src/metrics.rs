// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for Prometheus metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_DISCONNECTION: &str = "ws.disconnection";
pub const WS_ACTIVE: &str = "ws.active";
pub const ROOM_JOINED: &str = "room.joined";
pub const ROOM_REJECTED_FULL: &str = "room.rejected_full";
pub const ROOMS_ACTIVE: &str = "room.active";
pub const RELAY_FORWARDED: &str = "relay.forwarded";
pub const RELAY_DROPPED: &str = "relay.dropped";
pub const SESSION_OPENED: &str = "session.opened";
pub const SESSION_DISCARDED: &str = "session.discarded";
pub const SESSION_CLOSED: &str = "session.closed";
pub const SESSIONS_ACTIVE: &str = "session.active";
pub const CHUNK_ACCEPTED: &str = "chunk.accepted";
pub const CHUNK_REJECTED: &str = "chunk.rejected";
pub const CHUNK_DROPPED: &str = "chunk.dropped";
pub const CHUNK_BYTES: &str = "chunk.bytes";
pub const CHUNK_GAPS: &str = "chunk.gaps";
pub const MERGE_SUCCEEDED: &str = "merge.succeeded";
pub const MERGE_FAILED: &str = "merge.failed";
pub const MERGE_DURATION_SECS: &str = "merge.duration_secs";
