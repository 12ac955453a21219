use std::result::Result as StdResult;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error(transparent)]
    Storage(rusqlite::Error),
}

pub type Result<T> = StdResult<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, ref msg) = e {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                return Error::Integrity(msg.clone().unwrap_or_else(|| code.to_string()));
            }
        }
        Error::Storage(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedDocument(e.to_string())
    }
}
