//! Well-known JSON header field names. The server reads these and
//! forwards everything else unchanged.

pub const COMMAND: &str = "command";
pub const NAME: &str = "name";
pub const N: &str = "n";
pub const SERIALIZATION: &str = "serialization";
pub const TLS: &str = "tls";
pub const META: &str = "meta";
pub const STATUS: &str = "status";
pub const ERROR: &str = "error";
pub const DEVICES: &str = "devices";
pub const VARNAME: &str = "varname";
