use bytes::Bytes;
use serde_json::Value;

use crate::FrameError;

/// ASCII "DiME", the fixed prefix of every frame.
pub const MAGIC: &[u8; 4] = b"DiME";

/// Bytes consumed by `magic | jlen | blen` before the header starts.
pub const PREFIX_LEN: usize = 12;

/// The JSON control header: always a top-level object, with a `command`
/// field. Unknown keys are preserved and forwarded unchanged, so
/// this is a bag of values rather than a fixed struct.
pub type Header = serde_json::Map<String, Value>;

/// One wire frame: a JSON header plus an opaque binary body.
///
/// Cloning a `Frame` copies the header (small) and bumps the refcount of the
/// body (`Bytes`, cheap) — this is the "value-copied on enqueue" frame
/// semantics this gives us: every receiver's outbox gets its own
/// [`Frame`] value, never a live reference into the sender's buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: Header, body: impl Into<Bytes>) -> Self {
        Self { header, body: body.into() }
    }

    /// A frame with an empty header object and no body — used as the `sync`
    /// terminator sentinel before `status`/`meta` fields are attached.
    pub fn empty() -> Self {
        Self { header: Header::new(), body: Bytes::new() }
    }

    pub fn command(&self) -> Option<&str> {
        self.header.get(crate::field::COMMAND)?.as_str()
    }

    /// Serialize `magic | jlen | blen | header | body` onto `out`, appending
    /// rather than overwriting (callers append directly onto a connection's
    /// write buffer).
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), FrameError> {
        let header_bytes =
            serde_json::to_vec(&self.header).map_err(FrameError::HeaderNotJson)?;
        let jlen: u32 = header_bytes.len().try_into().map_err(|_| FrameError::TooLarge {
            len: header_bytes.len() as u64,
            max: u32::MAX,
        })?;
        let blen: u32 = self.body.len().try_into().map_err(|_| FrameError::TooLarge {
            len: self.body.len() as u64,
            max: u32::MAX,
        })?;

        out.reserve(PREFIX_LEN + header_bytes.len() + self.body.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&jlen.to_be_bytes());
        out.extend_from_slice(&blen.to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&self.body);
        Ok(())
    }
}

/// Incremental frame reader over a growable byte buffer.
///
/// `decode_from` never blocks and never allocates beyond what's needed to
/// hold one header + body; it consumes exactly the bytes of one frame from
/// the front of `buf` on success, and leaves `buf` untouched when there
/// isn't a full frame yet.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    max_body_len: u32,
}

impl Default for Decoder {
    fn default() -> Self {
        Self { max_body_len: crate::DEFAULT_MAX_BODY_LEN }
    }
}

impl Decoder {
    pub fn new(max_body_len: u32) -> Self {
        Self { max_body_len }
    }

    /// Attempts to pull one complete frame off the front of `buf`.
    ///
    /// - `Ok(None)`: not enough data buffered yet, try again after the next
    ///   read.
    /// - `Ok(Some(frame))`: one frame decoded and drained from `buf`.
    /// - `Err(_)`: framing violation; the connection must close without
    ///   resynchronizing.
    pub fn decode_from(&self, buf: &mut Vec<u8>) -> Result<Option<Frame>, FrameError> {
        if buf.len() >= MAGIC.len() && &buf[..MAGIC.len()] != MAGIC {
            return Err(FrameError::BadMagic);
        }
        if buf.len() < PREFIX_LEN {
            return Ok(None);
        }

        let jlen = u32::from_be_bytes(buf[4..8].try_into().expect("4-byte slice"));
        let blen = u32::from_be_bytes(buf[8..12].try_into().expect("4-byte slice"));

        if blen > self.max_body_len {
            return Err(FrameError::TooLarge { len: u64::from(blen), max: self.max_body_len });
        }

        let total = PREFIX_LEN + jlen as usize + blen as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let header_start = PREFIX_LEN;
        let header_end = header_start + jlen as usize;
        let header_str = std::str::from_utf8(&buf[header_start..header_end])
            .map_err(FrameError::HeaderNotUtf8)?;
        let header: Header =
            serde_json::from_str(header_str).map_err(FrameError::HeaderNotJson)?;
        let body = Bytes::copy_from_slice(&buf[header_end..total]);

        buf.drain(..total);
        Ok(Some(Frame { header, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(command: &str) -> Header {
        let mut h = Header::new();
        h.insert("command".to_owned(), Value::from(command));
        h
    }

    #[test]
    fn roundtrips_a_frame_with_a_body() {
        let frame = Frame::new(header("send"), Bytes::from_static(b"\x01\x02\x03"));
        let mut buf = Vec::new();
        frame.encode_into(&mut buf).unwrap();

        let decoder = Decoder::default();
        let decoded = decoder.decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_more_data_on_partial_frame() {
        let frame = Frame::new(header("sync"), Bytes::new());
        let mut buf = Vec::new();
        frame.encode_into(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        let decoder = Decoder::default();
        assert!(decoder.decode_from(&mut buf).unwrap().is_none());
        // nothing consumed while waiting
        assert!(!buf.is_empty());
    }

    #[test]
    fn rejects_bad_magic_immediately() {
        let mut buf = b"XXXX".to_vec();
        let decoder = Decoder::default();
        assert!(matches!(decoder.decode_from(&mut buf), Err(FrameError::BadMagic)));
    }

    #[test]
    fn rejects_oversize_body_without_buffering_it() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());

        let decoder = Decoder::new(1024);
        assert!(matches!(decoder.decode_from(&mut buf), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn decodes_multiple_queued_frames_one_at_a_time() {
        let mut buf = Vec::new();
        Frame::new(header("join"), Bytes::new()).encode_into(&mut buf).unwrap();
        Frame::new(header("leave"), Bytes::new()).encode_into(&mut buf).unwrap();

        let decoder = Decoder::default();
        let first = decoder.decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(first.command(), Some("join"));
        let second = decoder.decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(second.command(), Some("leave"));
        assert!(buf.is_empty());
    }
}
