//! Error types for pgkit.
//!
//! Queries never return these: every query operation resolves to a
//! [`QueryResult`](crate::QueryResult). These cover the synchronous edges of
//! the API, configuration parsing and channel subscription.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("Channel '{0}' is reserved")]
    ReservedChannel(String),

    #[error("Channel '{0}' is not a registered event")]
    UnknownChannel(String),
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_parse_errors_convert() {
        let err: Error = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, Error::InvalidUrl(_)));
        assert!(err.to_string().starts_with("Invalid connection URL: "));
    }
}
