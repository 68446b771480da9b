use std::{fmt, io, result};

/// Crate-wide result alias: one flat enum, one `Result` alias, no
/// trait-object boxing for the common cases.
pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A structural invariant was violated: out-of-order posting items,
    /// a `DELETED` sibling reached by a left/right step, an un-recoverable
    /// lost parent after exhausting right-links. Fatal; the operation that
    /// raised it must abort without persisting partial state.
    Invariant(String),
    /// An entry tuple (or posting batch) would not fit within
    /// `Config::max_item_size`. Carries enough detail for the caller's
    /// `errorTooBig` flag to decide whether to surface or swallow this.
    TooBig {
        attr: u16,
        size: usize,
        limit: usize,
    },
    /// A user-supplied opclass callback (`extract_value`, `consistent`,
    /// `compare`, `ordering`, ...) returned an error. Propagated unchanged.
    Callback(Box<dyn std::error::Error + Send + Sync + 'static>),
    /// I/O failure against the backing file.
    Io(io::Error),
    /// WAL staging or replay failed to reconstruct a consistent image.
    Wal(String),
    /// The on-disk format does not match what this engine understands
    /// (unexpected opaque flags, bad meta-page version, corrupt checksum).
    Corruption(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Invariant(msg) => write!(f, "invariant violation: {}", msg),
            Error::TooBig { attr, size, limit } => write!(
                f,
                "entry for attr {} is {} bytes, exceeds max_item_size {}",
                attr, size, limit
            ),
            Error::Callback(err) => write!(f, "opclass callback error: {}", err),
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::Wal(msg) => write!(f, "wal error: {}", msg),
            Error::Corruption(msg) => write!(f, "corruption: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Callback(err) => Some(err.as_ref()),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl Error {
    pub(crate) fn invariant<S: Into<String>>(msg: S) -> Error {
        Error::Invariant(msg.into())
    }

    pub(crate) fn too_big(attr: u16, size: usize, limit: usize) -> Error {
        Error::TooBig { attr, size, limit }
    }

    /// `true` for errors that leave the tree in a state a caller may retry
    /// against (e.g. concurrent structural change) as opposed to ones that
    /// indicate the on-disk image itself is unsound.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Invariant(_) | Error::Corruption(_))
    }
}
