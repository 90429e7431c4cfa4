use thiserror::Error;

/// Framing errors are always fatal for the connection: the
/// caller closes without attempting to resynchronize.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("bad magic")]
    BadMagic,
    #[error("header is not valid utf-8")]
    HeaderNotUtf8(#[source] std::str::Utf8Error),
    #[error("header is not a json object")]
    HeaderNotJson(#[source] serde_json::Error),
    #[error("frame too large: {len} bytes exceeds limit of {max}")]
    TooLarge { len: u64, max: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
