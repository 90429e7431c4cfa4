use thiserror::Error;

/// Fatal at startup only. Once a [`crate::Broker`] is running, per-connection
/// failures are handled by closing the connection, never by returning one of
/// these.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to bind {addr}")]
    Bind { addr: String, #[source] source: std::io::Error },
    #[error("unsupported address {0:?}: {1}")]
    UnsupportedAddress(String, &'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
