//! Entity size monitor tests
//!
//! Internal declarations and external entity streams share one document
//! total; each kind also has its own per-entity limit.

use std::fs;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use xmlguard::properties::MapProperties;
use xmlguard::reporter::RecordingReporter;
use xmlguard::{
    ConfigResolver, EntityResolver, Error, Feature, InputSource, LimitPolicy, MessageKey,
    ResourceIdentifier, Result, SecureConfiguration, SecureReader,
};

fn configuration(secure: bool) -> SecureConfiguration {
    let resolver = ConfigResolver::with_sources(
        Arc::new(MapProperties::new()),
        Arc::new(MapProperties::new()),
    );
    let mut config = SecureConfiguration::with_resolver(resolver).unwrap();
    config
        .set_feature(Feature::SecureProcessing.uri(), secure)
        .unwrap();
    config
        .set_feature(Feature::DisallowDoctype.uri(), false)
        .unwrap();
    config
}

fn check(config: &mut SecureConfiguration, xml: &str) -> Result<xmlguard::GuardReport> {
    SecureReader::new(config).check_str(xml)
}

fn key_and_limit(err: &Error) -> (MessageKey, Option<i64>) {
    let diag = err.diagnostic().expect("a fatal diagnostic");
    (diag.key, diag.limit())
}

const FOUR_ENTITIES: &str = r#"<!DOCTYPE r [
    <!ENTITY foo1 "ab">
    <!ENTITY foo2 "cd">
    <!ENTITY foo3 "ef">
    <!ENTITY foo4 "gh">
]><r>&foo1;&foo2;&foo3;&foo4;</r>"#;

const THREE_ENTITIES: &str = r#"<!DOCTYPE r [
    <!ENTITY foo1 "ab">
    <!ENTITY foo2 "cd">
    <!ENTITY foo3 "ef">
]><r>&foo1;&foo2;&foo3;</r>"#;

#[test]
fn test_general_entity_over_size_limit() {
    let mut config = configuration(true);
    config
        .set_property("jdk.xml.maxGeneralEntitySizeLimit", 8)
        .unwrap();

    let ok = r#"<!DOCTYPE r [<!ENTITY e "12345678">]><r>&e;</r>"#;
    assert!(check(&mut config, ok).is_ok());

    let big = r#"<!DOCTYPE r [<!ENTITY e "123456789">]><r>&e;</r>"#;
    let err = check(&mut config, big).unwrap_err();
    assert_eq!(
        key_and_limit(&err),
        (MessageKey::MaxGeneralEntitySizeLimitExceeded, Some(8))
    );
}

#[test]
fn test_total_entity_size() {
    let mut config = configuration(true);
    config
        .set_property("jdk.xml.totalEntitySizeLimit", 7)
        .unwrap();
    let err = check(&mut config, FOUR_ENTITIES).unwrap_err();
    assert_eq!(
        key_and_limit(&err),
        (MessageKey::TotalEntitySizeLimitExceeded, Some(7))
    );

    let report = check(&mut config, THREE_ENTITIES).unwrap();
    assert_eq!(report.entity_text, 6);

    config
        .set_property("jdk.xml.totalEntitySizeLimit", 8)
        .unwrap();
    let report = check(&mut config, FOUR_ENTITIES).unwrap();
    assert_eq!(report.entity_text, 8);
}

#[test]
fn test_counter_resets_between_documents() {
    let mut config = configuration(true);
    config
        .set_property("jdk.xml.totalEntitySizeLimit", 6)
        .unwrap();
    for _ in 0..3 {
        assert!(check(&mut config, THREE_ENTITIES).is_ok());
    }
}

#[test]
fn test_parameter_entity_size() {
    let mut config = configuration(true);
    let mut policy = LimitPolicy::default();
    policy.set_parameter_entity_size_limit(5);
    config.set_limit_policy(policy).unwrap();

    let xml = r#"<!DOCTYPE r [<!ENTITY % p "<!ELEMENT r ANY>">]><r/>"#;
    let err = check(&mut config, xml).unwrap_err();
    assert_eq!(
        key_and_limit(&err),
        (MessageKey::MaxParameterEntitySizeLimitExceeded, Some(5))
    );
}

#[test]
fn test_limit_violation_goes_through_reporter() {
    let reporter = Arc::new(RecordingReporter::new());
    let mut config = configuration(true);
    config.set_reporter(reporter.clone());
    config
        .set_property("jdk.xml.totalEntitySizeLimit", 7)
        .unwrap();

    assert!(check(&mut config, FOUR_ENTITIES).is_err());
    let seen = reporter.diagnostics();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].key, MessageKey::TotalEntitySizeLimitExceeded);
    assert_eq!(seen[0].domain(), "http://www.w3.org/TR/1998/REC-xml-19980210");
}

#[test]
fn test_external_file_entity_counted_when_open() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("ext.ent"), "12345678").unwrap();
    let doc = dir.path().join("doc.xml");
    fs::write(
        &doc,
        r#"<!DOCTYPE r [<!ENTITY ext SYSTEM "ext.ent">]><r>&ext;</r>"#,
    )
    .unwrap();

    let mut open = configuration(false);
    let report = SecureReader::new(&mut open).check_file(&doc).unwrap();
    assert_eq!(report.entity_expansions, 1);
    assert_eq!(report.entity_text, 8);

    open.set_property("jdk.xml.maxGeneralEntitySizeLimit", 7)
        .unwrap();
    let err = SecureReader::new(&mut open).check_file(&doc).unwrap_err();
    assert_eq!(
        key_and_limit(&err),
        (MessageKey::MaxGeneralEntitySizeLimitExceeded, Some(7))
    );

    // Secure processing closes the gate; the entity is never read.
    let mut closed = configuration(true);
    closed
        .set_property("jdk.xml.maxGeneralEntitySizeLimit", 7)
        .unwrap();
    let report = SecureReader::new(&mut closed).check_file(&doc).unwrap();
    assert_eq!(report.entity_expansions, 0);
    assert_eq!(report.entity_text, 0);
}

#[derive(Debug)]
struct InMemory;

impl EntityResolver for InMemory {
    fn resolve_entity(&self, id: &ResourceIdentifier) -> Result<Option<InputSource>> {
        match id.system_id.as_deref() {
            Some("urn:greeting") => Ok(Some(InputSource::from_text("urn:greeting", "héllo"))),
            _ => Ok(None),
        }
    }
}

#[test]
fn test_internal_and_external_share_total() {
    let mut config = configuration(false);
    config.set_entity_resolver(Some(Arc::new(InMemory)));
    let xml = r#"<!DOCTYPE r [
        <!ENTITY local "abc">
        <!ENTITY remote SYSTEM "urn:greeting">
    ]><r>&local;&remote;</r>"#;

    let report = check(&mut config, xml).unwrap();
    assert_eq!(report.entity_text, 3 + 5);

    config
        .set_property("jdk.xml.totalEntitySizeLimit", 7)
        .unwrap();
    let err = check(&mut config, xml).unwrap_err();
    assert_eq!(
        key_and_limit(&err),
        (MessageKey::TotalEntitySizeLimitExceeded, Some(7))
    );
}

#[test]
fn test_live_access_override_blocks_entity() {
    let mut config = configuration(false);
    config.set_entity_resolver(Some(Arc::new(InMemory)));
    config
        .limit_policy()
        .write()
        .set_access_external_dtd(Some("file"));

    let xml = r#"<!DOCTYPE r [<!ENTITY remote SYSTEM "urn:greeting">]><r>&remote;</r>"#;
    let err = check(&mut config, xml).unwrap_err();
    assert_eq!(
        err.diagnostic().map(|d| d.key),
        Some(MessageKey::AccessExternalEntity)
    );
}
