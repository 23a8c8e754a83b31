use std::fmt;

/// Errors surfaced by any pipeline stage.
///
/// Mirrors the taxonomy in the design: IO is always external (the core
/// never opens a file itself), `Parse`/`Type`/`Build` are produced inside
/// this crate. Allocation failure and the two "by design" cases (lowering
/// skip, autodiff unsupported op) are not represented as errors at all —
/// the former degenerates to the standard allocator, the latter are
/// non-fatal stderr warnings.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Parse(String),
    Type(String),
    Build(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Parse(msg) => write!(f, "{msg}"),
            Error::Type(msg) => write!(f, "{msg}"),
            Error::Build(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
