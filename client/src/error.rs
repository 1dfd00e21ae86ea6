use std::fmt;
use std::path::PathBuf;

/// Why an object could not be located by any backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionReason {
    /// Every backend that answered said the object does not exist.
    NotFound,
    /// A backend could not be reached or returned a server error.
    Unavailable,
    /// A backend answered, but the answer lacked a URL, name, or size we needed.
    Malformed,
}

impl fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionReason::NotFound => write!(f, "not found"),
            ResolutionReason::Unavailable => write!(f, "backend unavailable"),
            ResolutionReason::Malformed => write!(f, "malformed backend response"),
        }
    }
}

/// The error taxonomy shared by every crate in this workspace.  These values are carried inside
/// `anyhow::Error`; use [`error_kind`] to classify an arbitrary error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("could not resolve {object_id}: {reason}")]
    Resolution {
        object_id: String,
        reason: ResolutionReason,
    },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("local file {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Auth,
    Resolution,
    Transfer,
    LocalIo,
    Protocol,
}

impl ErrorKind {
    /// Only failures that another attempt might fix are retriable.  A missing local file stays
    /// missing no matter how long we back off.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transfer | ErrorKind::Resolution | ErrorKind::Auth
        )
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Resolution { .. } => ErrorKind::Resolution,
            Error::Transfer(_) => ErrorKind::Transfer,
            Error::LocalIo { .. } => ErrorKind::LocalIo,
            Error::Protocol(_) => ErrorKind::Protocol,
        }
    }

    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::LocalIo {
            path: path.into(),
            source,
        }
    }

    pub fn resolution(object_id: impl Into<String>, reason: ResolutionReason) -> Self {
        Error::Resolution {
            object_id: object_id.into(),
            reason,
        }
    }
}

/// Classify an error by walking its chain for a [`Error`].  Errors that carry no classification
/// (a bare `reqwest::Error` from a storage PUT, say) are transfer errors.
pub fn error_kind(err: &anyhow::Error) -> ErrorKind {
    // a classification attached with `.context(Error::..)` is only visible to downcast_ref
    if let Some(e) = err.downcast_ref::<Error>() {
        return e.kind();
    }
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<Error>() {
            return e.kind();
        }
    }
    ErrorKind::Transfer
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context() {
        let err: anyhow::Result<()> = Err(Error::local_io(
            "/no/such/file",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        )
        .into());
        let err = err.context("while uploading").unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::LocalIo);
        assert!(!error_kind(&err).is_retriable());
    }

    #[test]
    fn kind_as_context() {
        let err = anyhow::anyhow!("socket closed")
            .context(Error::Protocol("bad multipart response".to_owned()));
        assert_eq!(error_kind(&err), ErrorKind::Protocol);
    }

    #[test]
    fn unclassified_is_transfer() {
        let err = anyhow::anyhow!("connection reset");
        assert_eq!(error_kind(&err), ErrorKind::Transfer);
        assert!(error_kind(&err).is_retriable());
    }

    #[test]
    fn resolution_display() {
        let err = Error::resolution("dg.1/abc", ResolutionReason::NotFound);
        assert_eq!(err.to_string(), "could not resolve dg.1/abc: not found");
        assert!(err.kind().is_retriable());
    }
}
