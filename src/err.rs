#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("handshake failed after {attempts} attempts")]
    HandshakeFailed { attempts: u32 },

    #[error("session abandoned after {attempts} failed attempts")]
    Abandoned { attempts: u32 },

    #[error("channel error: {0}")]
    Channel(#[from] std::io::Error),

    #[error("session is closed")]
    Closed,
}
