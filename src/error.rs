use std::fmt;

/// The two trailing status bytes of an APDU response.
pub type StatusWord = [u8; 2];

pub const SW_SUCCESS: StatusWord = [0x90, 0x00];
pub const SW_AUTH_REQUIRED: StatusWord = [0x63, 0x00];

pub fn is_success(sw: StatusWord) -> bool {
    sw[0] == 0x90
}

/// Everything that can go wrong talking to a reader or a tag, surfaced as a
/// typed taxonomy rather than matched out of formatted strings.
#[derive(Debug)]
pub enum Error {
    /// No reader, or no card on the reader, at the time of the request.
    CardNotReady,
    /// The card on the reader does not match the UUID the caller expects.
    UuidMismatch { expected: String, actual: String },
    /// The request itself was malformed (missing password on a write, etc).
    BadRequest(String),
    /// PWD_AUTH was rejected by the tag.
    AuthFailed,
    /// The TLV stream on the tag was empty (terminator at offset zero).
    CardEmpty,
    /// GET_VERSION reported a product we don't know how to address.
    UnsupportedCard(String),
    /// APDU I/O failure, or a malformed/unexpected response.
    Transport(TransportError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::CardNotReady => write!(f, "no card ready"),
            Error::UuidMismatch { expected, actual } => {
                write!(f, "uuid mismatch: expected {}, card is {}", expected, actual)
            }
            Error::BadRequest(msg) => write!(f, "bad request: {}", msg),
            Error::AuthFailed => write!(f, "invalid password"),
            Error::CardEmpty => write!(f, "Card is empty!"),
            Error::UnsupportedCard(msg) => write!(f, "unsupported card: {}", msg),
            Error::Transport(t) => write!(f, "transport error: {}", t),
        }
    }
}

impl std::error::Error for Error {}

impl From<pcsc::Error> for Error {
    fn from(err: pcsc::Error) -> Error {
        Error::Transport(TransportError {
            status: None,
            kind: TransportErrorKind::Pcsc(err),
        })
    }
}

impl Error {
    pub fn malformed<S: Into<String>>(msg: S) -> Error {
        Error::Transport(TransportError {
            status: None,
            kind: TransportErrorKind::Malformed(msg.into()),
        })
    }

    pub fn status(sw: StatusWord) -> Error {
        Error::Transport(TransportError {
            status: Some(sw),
            kind: TransportErrorKind::StatusWord,
        })
    }

    /// Best-effort check, matching the "63 00" transient PWD_AUTH failure
    /// callers retry once on. Only meaningful directly after a failed
    /// transport call; stale reads of this predicate are permitted by design
    /// (readers not holding the facade lock get best-effort semantics).
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Error::Transport(t) if t.status == Some(SW_AUTH_REQUIRED))
    }
}

#[derive(Debug)]
pub struct TransportError {
    pub status: Option<StatusWord>,
    pub kind: TransportErrorKind,
}

#[derive(Debug)]
pub enum TransportErrorKind {
    Pcsc(pcsc::Error),
    ShortResponse,
    StatusWord,
    Malformed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            TransportErrorKind::Pcsc(e) => write!(f, "{}", e),
            TransportErrorKind::ShortResponse => write!(f, "response shorter than a status word"),
            TransportErrorKind::StatusWord => write!(
                f,
                "card returned status {:02X}{:02X}",
                self.status.unwrap_or([0, 0])[0],
                self.status.unwrap_or([0, 0])[1]
            ),
            TransportErrorKind::Malformed(msg) => write!(f, "{}", msg),
        }
    }
}
