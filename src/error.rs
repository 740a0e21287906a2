//! Error types for xmlguard
//!
//! This module defines the crate error type and the `Diagnostic` carried by
//! fatal limit violations raised through the reporting sink.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::reporter::{self, MessageKey};

/// Result type alias using xmlguard Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for xmlguard operations
#[derive(Error, Debug)]
pub enum Error {
    /// A fatal diagnostic raised by a limit, access or doctype check
    #[error("{0}")]
    Fatal(Diagnostic),

    /// A system identifier whose scheme cannot be derived
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// URL parsing error
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// I/O error from an external resource
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// XML tokenizer error
    #[error("XML error: {0}")]
    Xml(String),

    /// Malformed DTD declaration
    #[error("DTD error: {0}")]
    Dtd(String),

    /// A property value of the wrong type
    #[error("configuration error: {0}")]
    Config(String),

    /// A property or feature key that no setting answers to
    #[error("unknown property: {0}")]
    UnknownProperty(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The diagnostic behind a fatal error, if any
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Error::Fatal(diag) => Some(diag),
            _ => None,
        }
    }

    /// Wrap this error so it can cross a `std::io::Read` boundary
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(err) => err,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // Violations raised inside counting streams come back wrapped.
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return match err.into_inner().map(|inner| inner.downcast::<Error>()) {
                Some(Ok(inner)) => *inner,
                Some(Err(other)) => Error::Other(other.to_string()),
                None => Error::Other("empty I/O error".to_string()),
            };
        }
        Error::Io(err)
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err.to_string())
    }
}

/// Severity of a reported diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Reported, processing continues
    Warning,
    /// Recoverable error
    Error,
    /// Processing stops
    FatalError,
}

/// A single message argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageArg {
    /// A number, rendered with grouped thousands
    Int(i64),
    /// Free text
    Text(String),
}

impl fmt::Display for MessageArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageArg::Int(n) => f.write_str(&reporter::format_grouped(*n)),
            MessageArg::Text(s) => f.write_str(s),
        }
    }
}

impl From<i32> for MessageArg {
    fn from(n: i32) -> Self {
        MessageArg::Int(n.into())
    }
}

impl From<i64> for MessageArg {
    fn from(n: i64) -> Self {
        MessageArg::Int(n)
    }
}

impl From<&str> for MessageArg {
    fn from(s: &str) -> Self {
        MessageArg::Text(s.to_string())
    }
}

impl From<String> for MessageArg {
    fn from(s: String) -> Self {
        MessageArg::Text(s)
    }
}

/// A diagnostic as handed to the reporting sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Message key, which also determines the domain
    pub key: MessageKey,
    /// Arguments substituted into the message template
    pub args: Vec<MessageArg>,
    /// Severity
    pub severity: Severity,
    /// System identifier of the entity being read, if known
    pub system_id: Option<String>,
}

impl Diagnostic {
    /// Create a fatal diagnostic with no arguments
    pub fn fatal(key: MessageKey) -> Self {
        Self {
            key,
            args: Vec::new(),
            severity: Severity::FatalError,
            system_id: None,
        }
    }

    /// Append a message argument
    pub fn with_arg(mut self, arg: impl Into<MessageArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the system identifier
    pub fn with_system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = Some(system_id.into());
        self
    }

    /// Error domain the key belongs to
    pub fn domain(&self) -> &'static str {
        self.key.domain()
    }

    /// Rendered, user-facing message
    pub fn message(&self) -> String {
        reporter::format_message(self.key, &self.args)
    }

    /// Last numeric argument; for limit keys, the configured limit
    pub fn limit(&self) -> Option<i64> {
        self.args.iter().rev().find_map(|arg| match arg {
            MessageArg::Int(n) => Some(*n),
            MessageArg::Text(_) => None,
        })
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())?;

        if let Some(ref system_id) = self.system_id {
            write!(f, "\n\nEntity: {}", system_id)?;
        }

        Ok(())
    }
}
