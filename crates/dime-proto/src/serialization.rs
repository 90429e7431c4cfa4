use std::fmt;

/// Serialization format negotiated at handshake. Opaque to the
/// broker beyond this tag — bodies are never decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Serialization {
    Pickle,
    Dimeb,
    Json,
    Matlab,
}

impl Serialization {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pickle => "pickle",
            Self::Dimeb => "dimeb",
            Self::Json => "json",
            Self::Matlab => "matlab",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pickle" => Some(Self::Pickle),
            "dimeb" => Some(Self::Dimeb),
            "json" => Some(Self::Json),
            "matlab" => Some(Self::Matlab),
            _ => None,
        }
    }
}

impl fmt::Display for Serialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Serialization {
    /// The reference client defaults to `pickle`; `dimeb` is the
    /// broker-native fallback offered to clients the server doesn't
    /// otherwise recognize.
    fn default() -> Self {
        Self::Pickle
    }
}
