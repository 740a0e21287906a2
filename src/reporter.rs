//! Diagnostic reporting
//!
//! Limit violations are raised through an `ErrorReporter`, the parser's
//! shared error channel. Messages are rendered from fixed templates and
//! numeric arguments are displayed with grouped thousands (`45,678`).

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::{Diagnostic, Error, MessageArg, Result, Severity};

/// Error domain of XML well-formedness and DTD messages
pub const XML_DOMAIN: &str = "http://www.w3.org/TR/1998/REC-xml-19980210";

/// Error domain of XML Schema messages
pub const XSD_DOMAIN: &str = "http://www.w3.org/TR/xml-schema-1";

/// Message keys raised by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// `{0}` = limit
    EntityExpansionLimitExceeded,
    /// `{0}` = element, `{1}` = limit
    ElementAttributeLimit,
    /// `{0}` = element, `{1}` = depth, `{2}` = limit
    MaxElementDepthLimit,
    /// `{0}` = limit
    MaxOccurLimit,
    /// `{0}` = limit
    TotalEntitySizeLimitExceeded,
    /// `{0}` = limit
    MaxGeneralEntitySizeLimitExceeded,
    /// `{0}` = limit
    MaxParameterEntitySizeLimitExceeded,
    /// No arguments
    DoctypeNotAllowed,
    /// `{0}` = system id, `{1}` = protocol
    AccessExternalDtd,
    /// `{0}` = system id, `{1}` = protocol
    AccessExternalEntity,
    /// `{0}` = system id, `{1}` = protocol
    AccessExternalSchema,
    /// `{0}` = entity, `{1}` = reference path
    RecursiveReference,
}

impl MessageKey {
    /// Stable key string, as used by existing tooling
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKey::EntityExpansionLimitExceeded => "EntityExpansionLimitExceeded",
            MessageKey::ElementAttributeLimit => "ElementAttributeLimit",
            MessageKey::MaxElementDepthLimit => "MaxElementDepthLimit",
            MessageKey::MaxOccurLimit => "maxOccurLimit",
            MessageKey::TotalEntitySizeLimitExceeded => "TotalEntitySizeLimitExceeded",
            MessageKey::MaxGeneralEntitySizeLimitExceeded => "MaxGeneralEntitySizeLimitExceeded",
            MessageKey::MaxParameterEntitySizeLimitExceeded => "MaxParameterEntitySizeLimitExceeded",
            MessageKey::DoctypeNotAllowed => "DoctypeNotAllowed",
            MessageKey::AccessExternalDtd => "AccessExternalDTD",
            MessageKey::AccessExternalEntity => "AccessExternalEntity",
            MessageKey::AccessExternalSchema => "schema_reference.access",
            MessageKey::RecursiveReference => "RecursiveReference",
        }
    }

    /// Domain the key is reported under
    pub fn domain(&self) -> &'static str {
        match self {
            MessageKey::MaxOccurLimit | MessageKey::AccessExternalSchema => XSD_DOMAIN,
            _ => XML_DOMAIN,
        }
    }

    fn template(&self) -> &'static str {
        match self {
            MessageKey::EntityExpansionLimitExceeded => {
                "The parser has encountered more than \"{0}\" entity expansions in this document; this is the limit imposed by the application."
            }
            MessageKey::ElementAttributeLimit => {
                "Element \"{0}\" has more than \"{1}\" attributes, \"{1}\" is the limit imposed by the application."
            }
            MessageKey::MaxElementDepthLimit => {
                "The element \"{0}\" has a depth of \"{1}\" that exceeds the limit \"{2}\" set by the application."
            }
            MessageKey::MaxOccurLimit => {
                "Current configuration of the parser doesn't allow a maxOccurs attribute value to be set greater than the value {0}."
            }
            MessageKey::TotalEntitySizeLimitExceeded => {
                "The accumulated size of entities exceeded the \"{0}\" limit set by the application."
            }
            MessageKey::MaxGeneralEntitySizeLimitExceeded => {
                "The size of a general entity exceeded the \"{0}\" limit set by the application."
            }
            MessageKey::MaxParameterEntitySizeLimitExceeded => {
                "The size of a parameter entity exceeded the \"{0}\" limit set by the application."
            }
            MessageKey::DoctypeNotAllowed => {
                "DOCTYPE is disallowed when the feature \"http://apache.org/xml/features/disallow-doctype-decl\" set to true."
            }
            MessageKey::AccessExternalDtd => {
                "External DTD: Failed to read external DTD '{0}', because '{1}' access is not allowed due to restriction set by the accessExternalDTD property."
            }
            MessageKey::AccessExternalEntity => {
                "External Entity: Failed to read external document '{0}', because '{1}' access is not allowed due to restriction set by the accessExternalDTD property."
            }
            MessageKey::AccessExternalSchema => {
                "schema_reference: Failed to read schema document '{0}', because '{1}' access is not allowed due to restriction set by the accessExternalSchema property."
            }
            MessageKey::RecursiveReference => {
                "Recursive entity reference \"{0}\". (Reference path: {1})"
            }
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a message template, substituting `{n}` with the n-th argument
pub fn format_message(key: MessageKey, args: &[MessageArg]) -> String {
    let template = key.template();
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let index = after
            .find('}')
            .and_then(|close| after[..close].parse::<usize>().ok().map(|i| (i, close)));

        match index {
            Some((i, close)) if i < args.len() => {
                out.push_str(&args[i].to_string());
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Format an integer with comma-grouped thousands
pub fn format_grouped(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// The parser's diagnostic channel
///
/// A fatal diagnostic must come back as `Err(Error::Fatal(..))` so the
/// enclosing parse unwinds.
pub trait ErrorReporter: fmt::Debug + Send + Sync {
    /// Report a diagnostic
    fn report(&self, diagnostic: Diagnostic) -> Result<()>;
}

/// Shared handle to a reporter
pub type SharedReporter = Arc<dyn ErrorReporter>;

/// Default reporter: logs and fails on fatal diagnostics
#[derive(Debug, Default)]
pub struct LoggingReporter;

impl ErrorReporter for LoggingReporter {
    fn report(&self, diagnostic: Diagnostic) -> Result<()> {
        match diagnostic.severity {
            Severity::FatalError => {
                warn!(key = %diagnostic.key, domain = diagnostic.domain(), "{}", diagnostic.message());
                Err(Error::Fatal(diagnostic))
            }
            _ => {
                debug!(key = %diagnostic.key, "{}", diagnostic.message());
                Ok(())
            }
        }
    }
}

/// Reporter that keeps every diagnostic it receives
#[derive(Debug, Default)]
pub struct RecordingReporter {
    seen: Mutex<Vec<Diagnostic>>,
}

impl RecordingReporter {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Diagnostics received so far
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, diagnostic: Diagnostic) -> Result<()> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic.clone());
        LoggingReporter.report(diagnostic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_grouped() {
        assert_eq!(format_grouped(0), "0");
        assert_eq!(format_grouped(999), "999");
        assert_eq!(format_grouped(1000), "1,000");
        assert_eq!(format_grouped(12_345), "12,345");
        assert_eq!(format_grouped(45_678), "45,678");
        assert_eq!(format_grouped(2_147_483_647), "2,147,483,647");
        assert_eq!(format_grouped(-1_000_000), "-1,000,000");
    }

    #[test]
    fn test_format_message_substitutes_repeated_args() {
        let msg = format_message(
            MessageKey::ElementAttributeLimit,
            &[MessageArg::from("bar"), MessageArg::from(10_000)],
        );
        assert_eq!(
            msg,
            "Element \"bar\" has more than \"10,000\" attributes, \"10,000\" is the limit imposed by the application."
        );
    }

    #[test]
    fn test_format_message_missing_arg_left_verbatim() {
        let msg = format_message(MessageKey::TotalEntitySizeLimitExceeded, &[]);
        assert!(msg.contains("\"{0}\""));
    }

    #[test]
    fn test_recording_reporter_fails_on_fatal() {
        let reporter = RecordingReporter::new();
        let result = reporter.report(Diagnostic::fatal(MessageKey::DoctypeNotAllowed));
        assert!(matches!(result, Err(Error::Fatal(_))));

        let result = reporter.report(
            Diagnostic::fatal(MessageKey::DoctypeNotAllowed).with_severity(Severity::Warning),
        );
        assert!(result.is_ok());
        assert_eq!(reporter.diagnostics().len(), 2);
    }

    #[test]
    fn test_domains() {
        assert_eq!(MessageKey::MaxOccurLimit.domain(), XSD_DOMAIN);
        assert_eq!(MessageKey::TotalEntitySizeLimitExceeded.domain(), XML_DOMAIN);
    }
}
