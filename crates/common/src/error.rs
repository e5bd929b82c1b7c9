//! Error plumbing shared by every ploinky crate.
//!
//! Each crate keeps its own `thiserror` enum with a `Message` variant for
//! free-form failures and implements `From<String>` for it. Invoking
//! [`error_context!`] in that crate's error module then generates a local
//! `Context` trait so call sites can write
//! `fs::read_to_string(&path).context("reading .ploinky/agents")` and get
//! the crate's own error back instead of an `io::Error`.

use thiserror::Error;

/// Failures raised by the shared plumbing itself: the crash-safe file IO
/// and JSON encoding under `.ploinky/`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Generate a crate-local `Context` trait with `.context()` and
/// `.with_context()` on `Result` and `Option`, producing the given error
/// type through its `From<String>` impl.
///
/// Invoke once in a crate's error module, naming its error enum:
///
/// ```ignore
/// // in crates/workspace/src/error.rs
/// ploinky_common::error_context!(Error);
/// ```
///
/// The failure text keeps the cause: `"parsing manifest.json: expected
/// value at line 3"`.
#[macro_export]
macro_rules! error_context {
    ($error:ty) => {
        pub trait Context<T> {
            fn context(self, msg: impl Into<String>) -> std::result::Result<T, $error>;
            fn with_context<C, F>(self, f: F) -> std::result::Result<T, $error>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, msg: impl Into<String>) -> std::result::Result<T, $error> {
                self.map_err(|cause| <$error>::from(format!("{}: {cause}", msg.into())))
            }

            fn with_context<C, F>(self, f: F) -> std::result::Result<T, $error>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|cause| <$error>::from(format!("{}: {cause}", f().into())))
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, msg: impl Into<String>) -> std::result::Result<T, $error> {
                self.ok_or_else(|| <$error>::from(msg.into()))
            }

            fn with_context<C, F>(self, f: F) -> std::result::Result<T, $error>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <$error>::from(f().into()))
            }
        }
    };
}

error_context!(Error);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_the_cause() {
        let result: Result<String> = std::fs::read_to_string("/nonexistent/.ploinky/agents")
            .context("reading .ploinky/agents");
        let message = result.unwrap_err().to_string();
        assert!(message.starts_with("reading .ploinky/agents: "));
        assert!(message.len() > "reading .ploinky/agents: ".len());
    }

    #[test]
    fn test_option_context() {
        let port: Option<u16> = None;
        let err = port.context("no router port recorded").unwrap_err();
        assert_eq!(err.to_string(), "no router port recorded");
    }

    #[test]
    fn test_with_context_is_lazy() {
        let mut called = false;
        let ok: std::result::Result<u16, std::io::Error> = Ok(21080);
        let value = ok
            .with_context(|| {
                called = true;
                "not evaluated on Ok"
            })
            .unwrap();
        assert_eq!(value, 21080);
        assert!(!called);
    }

    #[test]
    fn test_json_errors_convert() {
        fn parse() -> Result<serde_json::Value> {
            Ok(serde_json::from_str("{not json")?)
        }
        assert!(matches!(parse().unwrap_err(), Error::Json(_)));
    }
}
