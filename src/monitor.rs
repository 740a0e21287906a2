//! Entity size monitors
//!
//! Two places see entity text during a parse: declarations of internal
//! entities in the DTD, and the streams of external entities opened through
//! the entity resolver. [`InternalEntityMonitor`] sits in the DTD pipeline
//! for the first; [`ExternalEntityMonitor`] wraps the resolver for the
//! second. Both add into one [`EntityCounter`] per parse, so internal and
//! external text share the document total.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};
use url::Url;

use crate::dtd::{is_parameter_entity, DtdEvent, DtdFilter};
use crate::error::{Diagnostic, Error, Result};
use crate::limits::{exceeds, LimitPolicy, PolicyHandle};
use crate::reporter::{MessageKey, SharedReporter};

/// Running total of entity text in one document
///
/// Clones share the total.
#[derive(Debug, Clone, Default)]
pub struct EntityCounter {
    total: Arc<AtomicU64>,
}

impl EntityCounter {
    /// Counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` and return the new total
    pub fn add(&self, delta: u64) -> u64 {
        self.total.fetch_add(delta, Ordering::Relaxed) + delta
    }

    /// Current total
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Size checks for one update, in evaluation order
///
/// The document total is checked first, then `entity_size` against the
/// limit for its kind.
pub fn check_entity_size(
    policy: &LimitPolicy,
    entity_size: u64,
    total: u64,
    parameter: bool,
) -> Vec<Diagnostic> {
    let mut tripped = Vec::new();
    let total_limit = policy.total_entity_size_limit();
    if exceeds(total_limit, total) {
        tripped.push(Diagnostic::fatal(MessageKey::TotalEntitySizeLimitExceeded).with_arg(total_limit));
    }
    if parameter {
        let limit = policy.parameter_entity_size_limit();
        if exceeds(limit, entity_size) {
            tripped.push(Diagnostic::fatal(MessageKey::MaxParameterEntitySizeLimitExceeded).with_arg(limit));
        }
    } else {
        let limit = policy.general_entity_size_limit();
        if exceeds(limit, entity_size) {
            tripped.push(Diagnostic::fatal(MessageKey::MaxGeneralEntitySizeLimitExceeded).with_arg(limit));
        }
    }
    tripped
}

/// Report the first tripped check and fail; log the rest
fn report_first(reporter: &SharedReporter, tripped: Vec<Diagnostic>) -> Result<()> {
    let mut tripped = tripped.into_iter();
    let first = match tripped.next() {
        Some(diag) => diag,
        None => return Ok(()),
    };
    for other in tripped {
        debug!(key = %other.key, "additional limit exceeded: {}", other.message());
    }
    reporter.report(first.clone())?;
    Err(Error::Fatal(first))
}

/// DTD pipeline stage counting internal entity text
#[derive(Debug)]
pub struct InternalEntityMonitor {
    policy: PolicyHandle,
    counter: EntityCounter,
    reporter: SharedReporter,
}

impl InternalEntityMonitor {
    /// Monitor adding into `counter`
    pub fn new(policy: PolicyHandle, counter: EntityCounter, reporter: SharedReporter) -> Self {
        Self {
            policy,
            counter,
            reporter,
        }
    }
}

impl DtdFilter for InternalEntityMonitor {
    fn filter(&mut self, event: DtdEvent) -> Result<Option<DtdEvent>> {
        if let DtdEvent::InternalEntityDecl { name, text } = &event {
            let delta = text.chars().count() as u64;
            let total = self.counter.add(delta);
            trace!(entity = %name, delta, total, "internal entity declared");
            let tripped = check_entity_size(&self.policy.read(), delta, total, is_parameter_entity(name));
            if !tripped.is_empty() {
                report_first(&self.reporter, tripped)?;
            }
        }
        Ok(Some(event))
    }
}

/// Identifies an external resource to resolve
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceIdentifier {
    /// Public identifier
    pub public_id: Option<String>,
    /// System identifier, as written
    pub system_id: Option<String>,
    /// Base the system identifier is relative to
    pub base_system_id: Option<String>,
    /// Entity name, `%`-prefixed for parameter entities; absent for a DTD
    pub entity_name: Option<String>,
}

impl ResourceIdentifier {
    /// Identifier for a named entity
    pub fn entity(name: impl Into<String>, system_id: impl Into<String>) -> Self {
        Self {
            entity_name: Some(name.into()),
            system_id: Some(system_id.into()),
            ..Self::default()
        }
    }

    /// Set the base system identifier
    pub fn with_base(mut self, base: Option<String>) -> Self {
        self.base_system_id = base;
        self
    }

    /// The system identifier resolved against its base
    pub fn expanded_system_id(&self) -> Option<String> {
        let system_id = self.system_id.as_deref()?;
        if Url::parse(system_id).is_ok() {
            return Some(system_id.to_string());
        }
        let joined = self
            .base_system_id
            .as_deref()
            .and_then(|base| base_url(base).ok())
            .and_then(|base| base.join(system_id).ok());
        Some(joined.map_or_else(|| system_id.to_string(), String::from))
    }
}

fn base_url(base: &str) -> Result<Url> {
    match Url::parse(base) {
        Ok(url) => Ok(url),
        Err(_) => {
            let path = std::env::current_dir()?.join(base);
            Url::from_file_path(&path)
                .map_err(|_| Error::InvalidUri(format!("not a usable base: {}", base)))
        }
    }
}

/// A resolved external resource
#[derive(Default)]
pub struct InputSource {
    /// Public identifier
    pub public_id: Option<String>,
    /// System identifier
    pub system_id: Option<String>,
    /// Base system identifier
    pub base_system_id: Option<String>,
    /// Raw bytes of the resource
    pub byte_stream: Option<Box<dyn Read + Send>>,
    /// Decoded UTF-8 text of the resource
    pub char_stream: Option<Box<dyn Read + Send>>,
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSource")
            .field("public_id", &self.public_id)
            .field("system_id", &self.system_id)
            .field("base_system_id", &self.base_system_id)
            .field("byte_stream", &self.byte_stream.is_some())
            .field("char_stream", &self.char_stream.is_some())
            .finish()
    }
}

impl InputSource {
    /// Source carrying only identifiers
    pub fn from_id(id: &ResourceIdentifier) -> Self {
        Self {
            public_id: id.public_id.clone(),
            system_id: id.expanded_system_id(),
            base_system_id: id.base_system_id.clone(),
            ..Self::default()
        }
    }

    /// Source over an in-memory text
    pub fn from_text(system_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            system_id: Some(system_id.into()),
            char_stream: Some(Box::new(io::Cursor::new(text.into().into_bytes()))),
            ..Self::default()
        }
    }

    /// Read the whole resource as text
    pub fn read_to_string(mut self) -> Result<String> {
        let mut text = String::new();
        if let Some(mut stream) = self.char_stream.take() {
            stream.read_to_string(&mut text)?;
        } else if let Some(mut stream) = self.byte_stream.take() {
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes)?;
            text = String::from_utf8(bytes)
                .map_err(|e| Error::Other(format!("external entity is not UTF-8: {}", e)))?;
        }
        Ok(text)
    }
}

/// Resolves external entities and DTDs to input sources
///
/// `Ok(None)` means the resolver has nothing for this identifier.
pub trait EntityResolver: fmt::Debug + Send + Sync {
    /// Resolve one resource
    fn resolve_entity(&self, id: &ResourceIdentifier) -> Result<Option<InputSource>>;
}

/// Resolver that returns identifiers only, leaving the open to the caller
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdResolver;

impl EntityResolver for SystemIdResolver {
    fn resolve_entity(&self, id: &ResourceIdentifier) -> Result<Option<InputSource>> {
        Ok(Some(InputSource::from_id(id)))
    }
}

/// Open a system identifier as a byte stream
///
/// Only local files are supported. No allow-list check happens here.
pub fn open_system_id(system_id: &str) -> Result<Box<dyn Read + Send>> {
    let path = match Url::parse(system_id) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map_err(|_| Error::InvalidUri(format!("not a local file: {}", system_id)))?,
        Ok(url) => {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no transport for scheme '{}'", url.scheme()),
            )))
        }
        Err(_) => PathBuf::from(system_id),
    };
    trace!(path = %path.display(), "opening external resource");
    Ok(Box::new(File::open(path)?))
}

/// Unit a monitored stream counts in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamUnit {
    /// Raw bytes
    Bytes,
    /// Unicode scalar values of UTF-8 text
    Chars,
}

/// Stream adapter counting what is read from an external entity
pub struct MonitoredStream<R> {
    inner: R,
    unit: StreamUnit,
    entity_name: String,
    parameter: bool,
    size: u64,
    policy: PolicyHandle,
    counter: EntityCounter,
    reporter: SharedReporter,
}

impl<R> fmt::Debug for MonitoredStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoredStream")
            .field("entity_name", &self.entity_name)
            .field("unit", &self.unit)
            .field("size", &self.size)
            .finish()
    }
}

impl<R: Read> MonitoredStream<R> {
    /// Wrap `inner`
    pub fn new(
        inner: R,
        unit: StreamUnit,
        entity_name: impl Into<String>,
        policy: PolicyHandle,
        counter: EntityCounter,
        reporter: SharedReporter,
    ) -> Self {
        let entity_name = entity_name.into();
        Self {
            parameter: is_parameter_entity(&entity_name),
            inner,
            unit,
            entity_name,
            size: 0,
            policy,
            counter,
            reporter,
        }
    }

    /// Units read from this stream so far
    pub fn size(&self) -> u64 {
        self.size
    }

    fn record(&mut self, chunk: &[u8]) -> Result<()> {
        let n = match self.unit {
            StreamUnit::Bytes => chunk.len(),
            // Continuation bytes are 0b10xx_xxxx.
            StreamUnit::Chars => chunk.iter().filter(|b| (**b & 0xC0) != 0x80).count(),
        } as u64;
        self.size += n;
        let total = self.counter.add(n);
        let tripped = check_entity_size(&self.policy.read(), self.size, total, self.parameter);
        if tripped.is_empty() {
            return Ok(());
        }
        report_first(&self.reporter, tripped)
    }
}

impl<R: Read> Read for MonitoredStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.record(&buf[..n]).map_err(Error::into_io)?;
        }
        Ok(n)
    }
}

/// Resolver wrapper counting every external entity it hands out
#[derive(Debug, Clone)]
pub struct ExternalEntityMonitor {
    inner: Option<Arc<dyn EntityResolver>>,
    policy: PolicyHandle,
    counter: EntityCounter,
    reporter: SharedReporter,
}

impl ExternalEntityMonitor {
    /// Wrap `inner`, adding into `counter`
    pub fn new(
        inner: Option<Arc<dyn EntityResolver>>,
        policy: PolicyHandle,
        counter: EntityCounter,
        reporter: SharedReporter,
    ) -> Self {
        Self {
            inner,
            policy,
            counter,
            reporter,
        }
    }

    /// The wrapped resolver
    pub fn inner(&self) -> Option<&Arc<dyn EntityResolver>> {
        self.inner.as_ref()
    }

    /// The counter shared with the rest of the parse
    pub fn counter(&self) -> &EntityCounter {
        &self.counter
    }

    fn monitored<R: Read + Send + 'static>(&self, inner: R, unit: StreamUnit, name: &str) -> Box<dyn Read + Send> {
        Box::new(MonitoredStream::new(
            inner,
            unit,
            name,
            self.policy.clone(),
            self.counter.clone(),
            self.reporter.clone(),
        ))
    }
}

impl EntityResolver for ExternalEntityMonitor {
    fn resolve_entity(&self, id: &ResourceIdentifier) -> Result<Option<InputSource>> {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return Ok(None),
        };
        let mut source = match inner.resolve_entity(id)? {
            Some(source) => source,
            None => return Ok(None),
        };
        if source.char_stream.is_none() && source.byte_stream.is_none() {
            let system_id = source
                .system_id
                .clone()
                .or_else(|| id.expanded_system_id())
                .ok_or_else(|| {
                    Error::InvalidUri(format!(
                        "{} has no system identifier",
                        id.entity_name.as_deref().unwrap_or("external resource")
                    ))
                })?;
            source.byte_stream = Some(open_system_id(&system_id)?);
        }

        // Only named entities count toward the size limits.
        let name = match id.entity_name.as_deref() {
            Some(name) => name,
            None => return Ok(Some(source)),
        };
        if let Some(stream) = source.char_stream.take() {
            source.char_stream = Some(self.monitored(stream, StreamUnit::Chars, name));
        } else if let Some(stream) = source.byte_stream.take() {
            source.byte_stream = Some(self.monitored(stream, StreamUnit::Bytes, name));
        }
        debug!(entity = name, system_id = ?source.system_id, "monitoring external entity");
        Ok(Some(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{ErrorReporter, RecordingReporter};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn policy(f: impl FnOnce(&mut LimitPolicy)) -> PolicyHandle {
        let mut p = LimitPolicy::default();
        f(&mut p);
        PolicyHandle::new(p)
    }

    fn declare(name: &str, text: &str) -> DtdEvent {
        DtdEvent::InternalEntityDecl {
            name: name.into(),
            text: text.into(),
        }
    }

    #[test]
    fn test_general_entity_size_limit() {
        let reporter = Arc::new(RecordingReporter::new());
        let mut monitor = InternalEntityMonitor::new(
            policy(|p| p.set_general_entity_size_limit(8)),
            EntityCounter::new(),
            reporter.clone(),
        );
        assert!(monitor.filter(declare("ok", "12345678")).unwrap().is_some());

        let err = monitor.filter(declare("big", "123456789")).unwrap_err();
        let diag = err.diagnostic().unwrap();
        assert_eq!(diag.key, MessageKey::MaxGeneralEntitySizeLimitExceeded);
        assert_eq!(diag.limit(), Some(8));
        assert_eq!(reporter.diagnostics().len(), 1);
    }

    #[derive(Debug)]
    struct Lenient;

    impl ErrorReporter for Lenient {
        fn report(&self, _diagnostic: Diagnostic) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_lenient_reporter_still_stops_the_parse() {
        let mut monitor = InternalEntityMonitor::new(
            policy(|p| p.set_general_entity_size_limit(8)),
            EntityCounter::new(),
            Arc::new(Lenient),
        );
        let err = monitor.filter(declare("big", "123456789")).unwrap_err();
        assert_eq!(
            err.diagnostic().map(|d| d.key),
            Some(MessageKey::MaxGeneralEntitySizeLimitExceeded)
        );

        let streams = ExternalEntityMonitor::new(
            Some(Arc::new(Fixed("0123456789"))),
            policy(|p| p.set_general_entity_size_limit(4)),
            EntityCounter::new(),
            Arc::new(Lenient),
        );
        let source = streams
            .resolve_entity(&ResourceIdentifier::entity("e", "e.xml"))
            .unwrap()
            .unwrap();
        let err = source.read_to_string().unwrap_err();
        assert_eq!(err.diagnostic().and_then(|d| d.limit()), Some(4));
    }

    #[test]
    fn test_parameter_entity_uses_its_own_limit() {
        let mut monitor = InternalEntityMonitor::new(
            policy(|p| p.set_parameter_entity_size_limit(3)),
            EntityCounter::new(),
            Arc::new(RecordingReporter::new()),
        );
        assert!(monitor.filter(declare("general", "12345")).is_ok());
        let err = monitor.filter(declare("%pe", "1234")).unwrap_err();
        assert_eq!(
            err.diagnostic().map(|d| d.key),
            Some(MessageKey::MaxParameterEntitySizeLimitExceeded)
        );
    }

    #[test]
    fn test_total_size_reported_first() {
        let counter = EntityCounter::new();
        let mut monitor = InternalEntityMonitor::new(
            policy(|p| {
                p.set_total_entity_size_limit(7);
                p.set_general_entity_size_limit(1);
            }),
            counter.clone(),
            Arc::new(RecordingReporter::new()),
        );
        counter.add(6);
        let err = monitor.filter(declare("two", "ab")).unwrap_err();
        let diag = err.diagnostic().unwrap();
        assert_eq!(diag.key, MessageKey::TotalEntitySizeLimitExceeded);
        assert_eq!(diag.limit(), Some(7));
    }

    #[test]
    fn test_other_events_pass_through() {
        let mut monitor = InternalEntityMonitor::new(
            policy(|p| p.set_total_entity_size_limit(-1)),
            EntityCounter::new(),
            Arc::new(RecordingReporter::new()),
        );
        let event = DtdEvent::ElementDecl {
            name: "a".into(),
            content_model: "EMPTY".into(),
        };
        assert_eq!(monitor.filter(event.clone()).unwrap(), Some(event));
    }

    #[derive(Debug)]
    struct Fixed(&'static str);

    impl EntityResolver for Fixed {
        fn resolve_entity(&self, id: &ResourceIdentifier) -> Result<Option<InputSource>> {
            Ok(Some(InputSource::from_text(
                id.system_id.clone().unwrap_or_default(),
                self.0,
            )))
        }
    }

    #[test]
    fn test_no_inner_resolver_yields_nothing() {
        let monitor = ExternalEntityMonitor::new(
            None,
            PolicyHandle::default(),
            EntityCounter::new(),
            Arc::new(RecordingReporter::new()),
        );
        assert!(monitor
            .resolve_entity(&ResourceIdentifier::entity("e", "e.xml"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_external_stream_shares_document_total() {
        let counter = EntityCounter::new();
        counter.add(5);
        let monitor = ExternalEntityMonitor::new(
            Some(Arc::new(Fixed("\u{e9}t\u{e9}"))),
            policy(|p| p.set_total_entity_size_limit(7)),
            counter.clone(),
            Arc::new(RecordingReporter::new()),
        );
        let source = monitor
            .resolve_entity(&ResourceIdentifier::entity("e", "e.xml"))
            .unwrap()
            .unwrap();
        let err = source.read_to_string().unwrap_err();
        assert_eq!(
            err.diagnostic().map(|d| d.key),
            Some(MessageKey::TotalEntitySizeLimitExceeded)
        );
        assert_eq!(counter.total(), 8);
    }

    #[test]
    fn test_external_parameter_entity_size() {
        let monitor = ExternalEntityMonitor::new(
            Some(Arc::new(Fixed("<!ELEMENT a EMPTY>"))),
            policy(|p| p.set_parameter_entity_size_limit(10)),
            EntityCounter::new(),
            Arc::new(RecordingReporter::new()),
        );
        let general = monitor
            .resolve_entity(&ResourceIdentifier::entity("g", "g.ent"))
            .unwrap()
            .unwrap();
        assert_eq!(general.read_to_string().unwrap(), "<!ELEMENT a EMPTY>");

        let parameter = monitor
            .resolve_entity(&ResourceIdentifier::entity("%p", "p.ent"))
            .unwrap()
            .unwrap();
        let err = parameter.read_to_string().unwrap_err();
        let diag = err.diagnostic().unwrap();
        assert_eq!(diag.key, MessageKey::MaxParameterEntitySizeLimitExceeded);
        assert_eq!(diag.limit(), Some(10));
    }

    #[test]
    fn test_opens_system_id_when_no_stream() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "0123456789").unwrap();
        let system_id = Url::from_file_path(file.path()).unwrap().to_string();

        let monitor = ExternalEntityMonitor::new(
            Some(Arc::new(SystemIdResolver)),
            policy(|p| p.set_general_entity_size_limit(9)),
            EntityCounter::new(),
            Arc::new(RecordingReporter::new()),
        );
        let source = monitor
            .resolve_entity(&ResourceIdentifier::entity("e", system_id))
            .unwrap()
            .unwrap();
        assert!(source.byte_stream.is_some());
        let err = source.read_to_string().unwrap_err();
        assert_eq!(err.diagnostic().and_then(|d| d.limit()), Some(9));
    }

    #[test]
    fn test_unnamed_resource_is_not_wrapped() {
        let counter = EntityCounter::new();
        let monitor = ExternalEntityMonitor::new(
            Some(Arc::new(Fixed("abc"))),
            policy(|p| p.set_total_entity_size_limit(1)),
            counter.clone(),
            Arc::new(RecordingReporter::new()),
        );
        let id = ResourceIdentifier {
            system_id: Some("doc.dtd".into()),
            ..ResourceIdentifier::default()
        };
        let source = monitor.resolve_entity(&id).unwrap().unwrap();
        assert_eq!(source.read_to_string().unwrap(), "abc");
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_relative_system_id_joins_base() {
        let id = ResourceIdentifier::entity("e", "sub/e.xml")
            .with_base(Some("file:///data/doc.xml".into()));
        assert_eq!(id.expanded_system_id().as_deref(), Some("file:///data/sub/e.xml"));
        let absolute = ResourceIdentifier::entity("e", "http://example.com/e.xml");
        assert_eq!(
            absolute.expanded_system_id().as_deref(),
            Some("http://example.com/e.xml")
        );
    }
}
