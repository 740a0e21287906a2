//! Document guard
//!
//! [`SecureReader`] walks a document with quick-xml and applies every check a
//! [`SecureConfiguration`] carries: the DOCTYPE ban, the DTD pipeline with its
//! entity monitors, gated and monitored external resources, entity expansion
//! counting, element depth, attribute count and XSD `maxOccurs`.
//!
//! Entity replacement text is scanned for further references but not parsed
//! as markup.

use std::path::Path;
use std::sync::Arc;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use tracing::{debug, trace};
use url::Url;

use crate::config::{AccessKind, SecureConfiguration};
use crate::dtd::{scan_subset, split_doctype, DtdEvent, DtdPipeline, EntityKind, EntityTable};
use crate::error::{Diagnostic, Error, Result};
use crate::limits::PolicyHandle;
use crate::monitor::{EntityResolver, ExternalEntityMonitor, ResourceIdentifier, SystemIdResolver};
use crate::reporter::MessageKey;
use crate::settings::Feature;
use crate::XSD_NAMESPACE;

const PREDEFINED: [&str; 5] = ["lt", "gt", "amp", "apos", "quot"];

/// What a guarded pass saw
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardReport {
    /// Root element named by the DOCTYPE
    pub doctype: Option<String>,
    /// Elements in the document
    pub elements: u64,
    /// Deepest element nesting
    pub max_depth: u64,
    /// Entity references expanded, general and parameter
    pub entity_expansions: u64,
    /// Entity text counted by the monitors
    pub entity_text: u64,
    /// Entities declared by the DTD
    pub entities_declared: usize,
    /// Whether some external DTD content was skipped
    pub skipped_external: bool,
}

/// Checks documents against one configuration
#[derive(Debug)]
pub struct SecureReader<'c> {
    config: &'c mut SecureConfiguration,
    system_id: Option<String>,
}

impl<'c> SecureReader<'c> {
    /// Reader over `config`
    pub fn new(config: &'c mut SecureConfiguration) -> Self {
        Self {
            config,
            system_id: None,
        }
    }

    /// Set the system identifier relative references resolve against
    pub fn with_system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = Some(system_id.into());
        self
    }

    /// Check a document held in memory
    pub fn check_str(&mut self, xml: &str) -> Result<GuardReport> {
        let pipeline = self.config.configure_pipeline(EntityTable::new());
        let mut pass = Pass::new(&*self.config, pipeline, self.system_id.clone());
        pass.run(xml)?;
        Ok(pass.finish())
    }

    /// Check a document on disk
    pub fn check_file(&mut self, path: impl AsRef<Path>) -> Result<GuardReport> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path)?;
        if self.system_id.is_none() {
            let absolute = std::fs::canonicalize(path)?;
            self.system_id = Some(
                Url::from_file_path(&absolute)
                    .map(String::from)
                    .unwrap_or_else(|_| absolute.display().to_string()),
            );
        }
        self.check_str(&xml)
    }
}

/// State of one guarded pass
struct Pass<'a> {
    config: &'a SecureConfiguration,
    policy: PolicyHandle,
    pipeline: DtdPipeline<EntityTable>,
    primary: ExternalEntityMonitor,
    fallback: ExternalEntityMonitor,
    system_id: Option<String>,
    namespaces: Vec<Vec<(String, String)>>,
    report: GuardReport,
}

impl<'a> Pass<'a> {
    fn new(config: &'a SecureConfiguration, pipeline: DtdPipeline<EntityTable>, system_id: Option<String>) -> Self {
        let primary = config.entity_resolver();
        let fallback = ExternalEntityMonitor::new(
            Some(Arc::new(SystemIdResolver)),
            config.limit_policy(),
            config.counter().clone(),
            config.reporter(),
        );
        Self {
            config,
            policy: config.limit_policy(),
            pipeline,
            primary,
            fallback,
            system_id,
            namespaces: Vec::new(),
            report: GuardReport::default(),
        }
    }

    fn finish(mut self) -> GuardReport {
        self.report.entity_text = self.config.counter().total();
        self.report.entities_declared = self.pipeline.sink().len();
        self.report
    }

    fn run(&mut self, xml: &str) -> Result<()> {
        let mut reader = Reader::from_reader(xml.as_bytes());
        let mut buf = Vec::new();
        let mut depth = 0u64;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::DocType(e)) => {
                    let text = std::str::from_utf8(&e)
                        .map_err(|e| Error::Xml(format!("DOCTYPE is not UTF-8: {}", e)))?;
                    self.doctype(text)?;
                }
                Ok(Event::Start(e)) => {
                    depth += 1;
                    self.start_element(&e, depth)?;
                }
                Ok(Event::Empty(e)) => {
                    self.start_element(&e, depth + 1)?;
                    self.namespaces.pop();
                }
                Ok(Event::End(_)) => {
                    depth = depth.saturating_sub(1);
                    self.namespaces.pop();
                }
                Ok(Event::Text(e)) => {
                    let text = std::str::from_utf8(&e)
                        .map_err(|e| Error::Xml(format!("text is not UTF-8: {}", e)))?;
                    self.expand_general(text, &mut Vec::new())?;
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(Error::Xml(format!(
                        "error at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
            buf.clear();
        }
        Ok(())
    }

    fn doctype(&mut self, text: &str) -> Result<()> {
        if self.config.is_enabled(Feature::DisallowDoctype) {
            return self.config.raise(Diagnostic::fatal(MessageKey::DoctypeNotAllowed));
        }

        let decl = split_doctype(text)?;
        self.report.doctype = Some(decl.root.clone());
        self.pipeline.dispatch(decl.start_event())?;

        if let Some(subset) = &decl.internal_subset {
            let events = scan_subset(subset, self.system_id.as_deref())?;
            self.run_dtd(events, &mut Vec::new())?;
        }

        if let Some(system_id) = &decl.system_id {
            if self.config.is_enabled(Feature::LoadExternalDtd) {
                let id = ResourceIdentifier {
                    public_id: decl.public_id.clone(),
                    system_id: Some(system_id.clone()),
                    base_system_id: self.system_id.clone(),
                    entity_name: None,
                };
                let (text, base) = self.fetch(AccessKind::Dtd, &id)?;
                let events = scan_subset(&text, base.as_deref())?;
                self.run_dtd(events, &mut Vec::new())?;
            } else {
                debug!(system_id = %system_id, "external DTD subset not loaded");
                self.report.skipped_external = true;
            }
        }

        self.pipeline.dispatch(DtdEvent::EndDtd)
    }

    fn run_dtd(&mut self, events: Vec<DtdEvent>, open: &mut Vec<String>) -> Result<()> {
        for event in events {
            let reference = match &event {
                DtdEvent::ParameterEntityReference { name } => Some(name.clone()),
                _ => None,
            };
            self.pipeline.dispatch(event)?;
            if let Some(name) = reference {
                self.include_parameter(&name, open)?;
            }
        }
        Ok(())
    }

    fn include_parameter(&mut self, name: &str, open: &mut Vec<String>) -> Result<()> {
        self.enter(name, open)?;
        let decl = self
            .pipeline
            .sink()
            .parameter(name)
            .cloned()
            .ok_or_else(|| Error::Dtd(format!("undeclared parameter entity {}", name)))?;

        match decl.kind {
            EntityKind::Internal(text) => {
                self.count_expansion()?;
                let events = scan_subset(&text, self.system_id.as_deref())?;
                self.run_dtd(events, open)?;
            }
            EntityKind::External {
                public_id,
                system_id,
                base_system_id,
            } => {
                if self.config.is_enabled(Feature::ExternalParameterEntities) {
                    self.count_expansion()?;
                    let id = ResourceIdentifier {
                        public_id,
                        system_id: Some(system_id),
                        base_system_id,
                        entity_name: Some(decl.name.clone()),
                    };
                    let (text, base) = self.fetch(AccessKind::Dtd, &id)?;
                    let events = scan_subset(&text, base.as_deref())?;
                    self.run_dtd(events, open)?;
                } else {
                    debug!(entity = name, "external parameter entity not loaded");
                    self.report.skipped_external = true;
                }
            }
            EntityKind::Unparsed { .. } => {
                return Err(Error::Dtd(format!("parameter entity {} is unparsed", name)));
            }
        }
        open.pop();
        Ok(())
    }

    /// Expand general entity references in text or an attribute value
    fn expand_general(&mut self, text: &str, open: &mut Vec<String>) -> Result<()> {
        let mut rest = text;
        while let Some(start) = rest.find('&') {
            let after = &rest[start + 1..];
            let end = after
                .find(';')
                .ok_or_else(|| Error::Xml(format!("unterminated reference in {:?}", text)))?;
            let name = &after[..end];
            rest = &after[end + 1..];
            if name.starts_with('#') || PREDEFINED.contains(&name) {
                continue;
            }
            self.expand_reference(name, open)?;
        }
        Ok(())
    }

    fn expand_reference(&mut self, name: &str, open: &mut Vec<String>) -> Result<()> {
        let decl = match self.pipeline.sink().general(name) {
            Some(decl) => decl.clone(),
            None if self.report.skipped_external => {
                debug!(entity = name, "reference to entity possibly declared externally");
                return Ok(());
            }
            None => return Err(Error::Xml(format!("undeclared entity '{}'", name))),
        };

        match decl.kind {
            EntityKind::Internal(text) => {
                self.enter(name, open)?;
                self.count_expansion()?;
                self.expand_general(&text, open)?;
                open.pop();
            }
            EntityKind::External {
                public_id,
                system_id,
                base_system_id,
            } => {
                if !self.config.is_enabled(Feature::ExternalGeneralEntities) {
                    debug!(entity = name, "external general entity not loaded");
                    return Ok(());
                }
                self.enter(name, open)?;
                self.count_expansion()?;
                let id = ResourceIdentifier {
                    public_id,
                    system_id: Some(system_id),
                    base_system_id,
                    entity_name: Some(decl.name.clone()),
                };
                let (text, _) = self.fetch(AccessKind::Entity, &id)?;
                self.expand_general(&text, open)?;
                open.pop();
            }
            EntityKind::Unparsed { .. } => {
                return Err(Error::Xml(format!("reference to unparsed entity '{}'", name)));
            }
        }
        Ok(())
    }

    /// Push `name` on the open-entity stack, failing on recursion
    fn enter(&mut self, name: &str, open: &mut Vec<String>) -> Result<()> {
        if open.iter().any(|n| n == name) {
            let path = open
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(name))
                .collect::<Vec<_>>()
                .join(" -> ");
            return self.config.raise(
                Diagnostic::fatal(MessageKey::RecursiveReference)
                    .with_arg(name)
                    .with_arg(path),
            );
        }
        open.push(name.to_string());
        Ok(())
    }

    fn count_expansion(&mut self) -> Result<()> {
        self.report.entity_expansions += 1;
        let tripped = self
            .policy
            .read()
            .check_entity_expansions(self.report.entity_expansions);
        match tripped {
            Some(diag) => self.config.raise(diag),
            None => Ok(()),
        }
    }

    /// Gate, resolve and read one external resource; returns its text and system id
    fn fetch(&self, kind: AccessKind, id: &ResourceIdentifier) -> Result<(String, Option<String>)> {
        let expanded = id.expanded_system_id();
        self.config.check_external_access(kind, expanded.as_deref())?;
        trace!(system_id = ?expanded, entity = ?id.entity_name, "fetching external resource");

        let source = match self.primary.resolve_entity(id)? {
            Some(source) => source,
            None => self
                .fallback
                .resolve_entity(id)?
                .ok_or_else(|| Error::Other(format!("cannot resolve {:?}", expanded)))?,
        };
        let base = source.system_id.clone().or(expanded);
        Ok((source.read_to_string()?, base))
    }

    fn start_element(&mut self, start: &BytesStart, depth: u64) -> Result<()> {
        let name = std::str::from_utf8(start.name().as_ref())
            .map_err(|e| Error::Xml(format!("invalid element name: {}", e)))?
            .to_string();
        self.report.elements += 1;
        self.report.max_depth = self.report.max_depth.max(depth);

        let depth_check = self.policy.read().check_element_depth(&name, depth);
        if let Some(diag) = depth_check {
            return self.config.raise(diag);
        }

        let mut count = 0u64;
        let mut scope = Vec::new();
        let mut max_occurs = None;
        for attr in start.attributes() {
            let attr = attr.map_err(|e| Error::Xml(format!("bad attribute on <{}>: {}", name, e)))?;
            count += 1;
            let key = std::str::from_utf8(attr.key.as_ref())
                .map_err(|e| Error::Xml(format!("invalid attribute name: {}", e)))?;
            let value = std::str::from_utf8(&attr.value)
                .map_err(|e| Error::Xml(format!("invalid attribute value: {}", e)))?;

            if key == "xmlns" {
                scope.push((String::new(), value.to_string()));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                scope.push((prefix.to_string(), value.to_string()));
            } else if key == "maxOccurs" {
                max_occurs = Some(value.trim().to_string());
            }
            self.expand_general(value, &mut Vec::new())?;
        }

        let attr_check = self.policy.read().check_attributes(&name, count);
        if let Some(diag) = attr_check {
            return self.config.raise(diag);
        }
        self.namespaces.push(scope);

        if let Some(value) = max_occurs {
            if self.namespace_of(&name) == Some(XSD_NAMESPACE) {
                self.check_max_occurs(&value)?;
            }
        }
        Ok(())
    }

    fn check_max_occurs(&self, value: &str) -> Result<()> {
        if value == "unbounded" {
            return Ok(());
        }
        let occurs = match value.parse::<u64>() {
            Ok(n) => n,
            Err(_) => {
                debug!(value, "ignoring non-numeric maxOccurs");
                return Ok(());
            }
        };
        let tripped = self.policy.read().check_max_occurs(occurs);
        match tripped {
            Some(diag) => self.config.raise(diag),
            None => Ok(()),
        }
    }

    /// Namespace bound to the prefix of a qualified name
    fn namespace_of(&self, qname: &str) -> Option<&str> {
        let prefix = qname.split_once(':').map_or("", |(p, _)| p);
        self.namespaces
            .iter()
            .rev()
            .flat_map(|scope| scope.iter())
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
            .filter(|uri| !uri.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::LimitPolicy;
    use crate::properties::MapProperties;
    use crate::resolver::ConfigResolver;
    use pretty_assertions::assert_eq;

    fn config() -> SecureConfiguration {
        let resolver = ConfigResolver::with_sources(
            Arc::new(MapProperties::new()),
            Arc::new(MapProperties::new()),
        );
        SecureConfiguration::with_resolver(resolver).unwrap()
    }

    fn permissive() -> SecureConfiguration {
        let mut cfg = config();
        cfg.set_feature(Feature::DisallowDoctype.uri(), false).unwrap();
        cfg
    }

    fn key_of(err: &Error) -> Option<MessageKey> {
        err.diagnostic().map(|d| d.key)
    }

    #[test]
    fn test_plain_document() {
        let mut cfg = config();
        let report = SecureReader::new(&mut cfg)
            .check_str("<a x='1'><b/><b>t &amp; &#65;</b></a>")
            .unwrap();
        assert_eq!(report.elements, 3);
        assert_eq!(report.max_depth, 2);
        assert_eq!(report.entity_expansions, 0);
        assert_eq!(report.doctype, None);
    }

    #[test]
    fn test_doctype_rejected_when_disallowed() {
        let mut cfg = config();
        let err = SecureReader::new(&mut cfg)
            .check_str("<!DOCTYPE a><a/>")
            .unwrap_err();
        assert_eq!(key_of(&err), Some(MessageKey::DoctypeNotAllowed));
    }

    #[test]
    fn test_internal_entities_expand_and_count() {
        let mut cfg = permissive();
        let xml = r#"<!DOCTYPE a [
            <!ENTITY one "1">
            <!ENTITY two "&one;&one;">
        ]><a v="&two;">&two;</a>"#;
        let report = SecureReader::new(&mut cfg).check_str(xml).unwrap();
        assert_eq!(report.doctype.as_deref(), Some("a"));
        assert_eq!(report.entities_declared, 2);
        assert_eq!(report.entity_expansions, 6);
        assert_eq!(report.entity_text, 1 + 10);
    }

    #[test]
    fn test_non_ascii_entity_text() {
        let mut cfg = permissive();
        let report = SecureReader::new(&mut cfg)
            .check_str("<!DOCTYPE r [<!ENTITY e \"caf\u{e9}\">]><r>&e;</r>")
            .unwrap();
        assert_eq!(report.entities_declared, 1);
        assert_eq!(report.entity_expansions, 1);
        assert_eq!(report.entity_text, 4);
    }

    #[test]
    fn test_recursive_entity_is_fatal() {
        let mut cfg = permissive();
        let xml = r#"<!DOCTYPE a [
            <!ENTITY x "&y;">
            <!ENTITY y "&x;">
        ]><a>&x;</a>"#;
        let err = SecureReader::new(&mut cfg).check_str(xml).unwrap_err();
        assert_eq!(key_of(&err), Some(MessageKey::RecursiveReference));
    }

    #[test]
    fn test_undeclared_entity() {
        let mut cfg = permissive();
        let err = SecureReader::new(&mut cfg)
            .check_str("<!DOCTYPE a []><a>&nope;</a>")
            .unwrap_err();
        assert!(matches!(err, Error::Xml(_)));
    }

    #[test]
    fn test_depth_and_attribute_limits() {
        let mut cfg = config();
        let mut policy = LimitPolicy::default();
        policy.set_max_element_depth(2);
        policy.set_element_attribute_limit(2);
        cfg.set_limit_policy(policy).unwrap();

        let err = SecureReader::new(&mut cfg)
            .check_str("<a><b><c/></b></a>")
            .unwrap_err();
        let diag = err.diagnostic().unwrap();
        assert_eq!(diag.key, MessageKey::MaxElementDepthLimit);
        assert_eq!(diag.limit(), Some(2));

        let err = SecureReader::new(&mut cfg)
            .check_str("<a x='1' y='2' z='3'/>")
            .unwrap_err();
        assert_eq!(key_of(&err), Some(MessageKey::ElementAttributeLimit));
        assert!(SecureReader::new(&mut cfg).check_str("<a x='1' y='2'/>").is_ok());
    }

    #[test]
    fn test_max_occurs_only_in_schema_namespace() {
        let mut cfg = config();
        cfg.set_property("jdk.xml.maxOccur", 10).unwrap();

        let schema = format!(
            r#"<xs:schema xmlns:xs="{}"><xs:element name="e" maxOccurs="11"/></xs:schema>"#,
            XSD_NAMESPACE
        );
        let err = SecureReader::new(&mut cfg).check_str(&schema).unwrap_err();
        let diag = err.diagnostic().unwrap();
        assert_eq!(diag.key, MessageKey::MaxOccurLimit);
        assert_eq!(diag.limit(), Some(10));

        let bounded = schema.replace("11", "unbounded");
        assert!(SecureReader::new(&mut cfg).check_str(&bounded).is_ok());
        let other = r#"<x:e xmlns:x="urn:other" maxOccurs="99"/>"#;
        assert!(SecureReader::new(&mut cfg).check_str(other).is_ok());
    }

    #[test]
    fn test_external_subset_skipped_when_not_loaded() {
        let mut cfg = permissive();
        let report = SecureReader::new(&mut cfg)
            .check_str(r#"<!DOCTYPE a SYSTEM "missing.dtd"><a>&fromdtd;</a>"#)
            .unwrap();
        assert!(report.skipped_external);
    }

    #[test]
    fn test_external_subset_gated_by_allow_list() {
        let mut cfg = permissive();
        cfg.set_feature(Feature::LoadExternalDtd.uri(), true).unwrap();
        let err = SecureReader::new(&mut cfg)
            .check_str(r#"<!DOCTYPE a SYSTEM "http://example.com/a.dtd"><a/>"#)
            .unwrap_err();
        assert_eq!(key_of(&err), Some(MessageKey::AccessExternalDtd));
    }

    #[test]
    fn test_parameter_entity_expands_declarations() {
        let mut cfg = permissive();
        let xml = r#"<!DOCTYPE a [
            <!ENTITY % decls "<!ENTITY inner 'abc'>">
            %decls;
        ]><a>&inner;</a>"#;
        let report = SecureReader::new(&mut cfg).check_str(xml).unwrap();
        assert_eq!(report.entities_declared, 2);
        assert_eq!(report.entity_expansions, 2);
    }
}
