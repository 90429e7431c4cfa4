//! Wire format for the DiME broker.
//!
//! A frame is `magic | jlen | blen | json header | opaque body` (see
//! [`Frame`], [`Decoder`]). The broker never looks inside `body`; only the
//! `command` field of the header (and a handful of routing fields alongside
//! it) is ever inspected.

mod error;
mod frame;
pub mod field;
pub mod command;
mod serialization;

pub use error::FrameError;
pub use frame::{Decoder, Frame, Header, MAGIC, PREFIX_LEN};
pub use serialization::Serialization;

/// Reference server accepts bodies up to at least 200 MiB; we
/// give ourselves headroom since large numeric arrays are the common case.
pub const DEFAULT_MAX_BODY_LEN: u32 = 256 * 1024 * 1024;

/// Success status, the only status value below a response frame is
/// considered routine.
pub const STATUS_OK: i64 = 0;
