//! Command names carried in the `command` header field.

pub const HANDSHAKE: &str = "handshake";
pub const JOIN: &str = "join";
pub const LEAVE: &str = "leave";
pub const SEND: &str = "send";
pub const BROADCAST: &str = "broadcast";
pub const SYNC: &str = "sync";
pub const WAIT: &str = "wait";
pub const DEVICES: &str = "devices";

/// Server-to-client meta-frame command, distinguished on the wire by
/// `status > 0` and `meta: true`.
pub const REREGISTER: &str = "reregister";
