//! Configuration keys
//!
//! Every limit and flag has one canonical key. The many spellings accepted at
//! the property API (legacy Xerces URIs, JAXP URIs, `jdk.xml.*` names) are
//! folded onto those keys by a static alias table, so nothing past the API
//! boundary ever compares property strings.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

/// A value stored on the limit policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Setting {
    /// Maximum number of entity expansions per document
    EntityExpansionLimit,
    /// Maximum number of attributes on one element
    ElementAttributeLimit,
    /// Maximum element nesting depth
    MaxElementDepth,
    /// Maximum `maxOccurs` value in a schema
    MaxOccurLimit,
    /// Maximum size of one general entity
    GeneralEntitySizeLimit,
    /// Maximum size of one parameter entity
    ParameterEntitySizeLimit,
    /// Maximum accumulated size of all entities in a document
    TotalEntitySizeLimit,
    /// Protocols allowed for external DTDs and entities
    AccessExternalDtd,
    /// Protocols allowed for external schemas
    AccessExternalSchema,
}

impl Setting {
    /// The numeric limits, in resolution order
    pub const LIMITS: [Setting; 7] = [
        Setting::EntityExpansionLimit,
        Setting::ElementAttributeLimit,
        Setting::MaxElementDepth,
        Setting::MaxOccurLimit,
        Setting::GeneralEntitySizeLimit,
        Setting::ParameterEntitySizeLimit,
        Setting::TotalEntitySizeLimit,
    ];

    /// All settings
    pub const ALL: [Setting; 9] = [
        Setting::EntityExpansionLimit,
        Setting::ElementAttributeLimit,
        Setting::MaxElementDepth,
        Setting::MaxOccurLimit,
        Setting::GeneralEntitySizeLimit,
        Setting::ParameterEntitySizeLimit,
        Setting::TotalEntitySizeLimit,
        Setting::AccessExternalDtd,
        Setting::AccessExternalSchema,
    ];

    /// Name looked up in the deployment file and the process properties
    pub fn system_property_name(&self) -> &'static str {
        match self {
            Setting::EntityExpansionLimit => "jdk.xml.entityExpansionLimit",
            Setting::ElementAttributeLimit => "jdk.xml.elementAttributeLimit",
            Setting::MaxElementDepth => "jdk.xml.maxElementDepth",
            Setting::MaxOccurLimit => "jdk.xml.maxOccur",
            Setting::GeneralEntitySizeLimit => "jdk.xml.maxGeneralEntitySizeLimit",
            Setting::ParameterEntitySizeLimit => "jdk.xml.maxParameterEntitySizeLimit",
            Setting::TotalEntitySizeLimit => "jdk.xml.totalEntitySizeLimit",
            Setting::AccessExternalDtd => "javax.xml.accessExternalDTD",
            Setting::AccessExternalSchema => "javax.xml.accessExternalSchema",
        }
    }

    /// Whether the setting holds a number
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Setting::AccessExternalDtd | Setting::AccessExternalSchema)
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.system_property_name())
    }
}

/// A boolean parser feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Feature {
    /// Master toggle that tightens the defaults of the gates below
    SecureProcessing,
    /// Reject any document carrying a DOCTYPE
    DisallowDoctype,
    /// Load the external DTD subset
    LoadExternalDtd,
    /// Resolve external general entities
    ExternalGeneralEntities,
    /// Resolve external parameter entities
    ExternalParameterEntities,
}

impl Feature {
    /// All features
    pub const ALL: [Feature; 5] = [
        Feature::SecureProcessing,
        Feature::DisallowDoctype,
        Feature::LoadExternalDtd,
        Feature::ExternalGeneralEntities,
        Feature::ExternalParameterEntities,
    ];

    /// Canonical URI of the feature
    pub fn uri(&self) -> &'static str {
        match self {
            Feature::SecureProcessing => "http://javax.xml.XMLConstants/feature/secure-processing",
            Feature::DisallowDoctype => "http://apache.org/xml/features/disallow-doctype-decl",
            Feature::LoadExternalDtd => "http://apache.org/xml/features/nonvalidating/load-external-dtd",
            Feature::ExternalGeneralEntities => "http://xml.org/sax/features/external-general-entities",
            Feature::ExternalParameterEntities => "http://xml.org/sax/features/external-parameter-entities",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

/// Canonical key behind any accepted spelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// A policy setting
    Setting(Setting),
    /// A boolean feature
    Feature(Feature),
}

lazy_static::lazy_static! {
    /// Every accepted spelling, mapped to its canonical key
    static ref ALIASES: HashMap<&'static str, ConfigKey> = {
        use crate::settings::ConfigKey::{Feature as F, Setting as S};

        let mut m = HashMap::new();
        m.insert("http://apache.org/xml/properties/entity-expansion-limit", S(Setting::EntityExpansionLimit));
        m.insert("http://www.oracle.com/xml/jaxp/properties/entityExpansionLimit", S(Setting::EntityExpansionLimit));
        m.insert("jdk.xml.entityExpansionLimit", S(Setting::EntityExpansionLimit));

        m.insert("http://apache.org/xml/properties/elementAttributeLimit", S(Setting::ElementAttributeLimit));
        m.insert("http://www.oracle.com/xml/jaxp/properties/elementAttributeLimit", S(Setting::ElementAttributeLimit));
        m.insert("jdk.xml.elementAttributeLimit", S(Setting::ElementAttributeLimit));

        m.insert("http://java.sun.com/xml/jaxp/properties/maxElementDepth", S(Setting::MaxElementDepth));
        m.insert("http://www.oracle.com/xml/jaxp/properties/maxElementDepth", S(Setting::MaxElementDepth));
        m.insert("jdk.xml.maxElementDepth", S(Setting::MaxElementDepth));

        m.insert("http://apache.org/xml/properties/maxOccurLimit", S(Setting::MaxOccurLimit));
        m.insert("http://www.oracle.com/xml/jaxp/properties/maxOccurLimit", S(Setting::MaxOccurLimit));
        m.insert("jdk.xml.maxOccur", S(Setting::MaxOccurLimit));

        m.insert("http://apache.org/xml/properties/maxGeneralEntitySizeLimit", S(Setting::GeneralEntitySizeLimit));
        m.insert("http://www.oracle.com/xml/jaxp/properties/maxGeneralEntitySizeLimit", S(Setting::GeneralEntitySizeLimit));
        m.insert("jdk.xml.maxGeneralEntitySizeLimit", S(Setting::GeneralEntitySizeLimit));

        m.insert("http://apache.org/xml/properties/maxParameterEntitySizeLimit", S(Setting::ParameterEntitySizeLimit));
        m.insert("http://www.oracle.com/xml/jaxp/properties/maxParameterEntitySizeLimit", S(Setting::ParameterEntitySizeLimit));
        m.insert("jdk.xml.maxParameterEntitySizeLimit", S(Setting::ParameterEntitySizeLimit));

        m.insert("http://apache.org/xml/properties/totalEntitySizeLimit", S(Setting::TotalEntitySizeLimit));
        m.insert("http://www.oracle.com/xml/jaxp/properties/totalEntitySizeLimit", S(Setting::TotalEntitySizeLimit));
        m.insert("jdk.xml.totalEntitySizeLimit", S(Setting::TotalEntitySizeLimit));

        m.insert("http://javax.xml.XMLConstants/property/accessExternalDTD", S(Setting::AccessExternalDtd));
        m.insert("javax.xml.accessExternalDTD", S(Setting::AccessExternalDtd));

        m.insert("http://javax.xml.XMLConstants/property/accessExternalSchema", S(Setting::AccessExternalSchema));
        m.insert("javax.xml.accessExternalSchema", S(Setting::AccessExternalSchema));

        m.insert("http://javax.xml.XMLConstants/feature/secure-processing", F(Feature::SecureProcessing));
        m.insert("http://apache.org/xml/features/secure-processing", F(Feature::SecureProcessing));

        m.insert("http://apache.org/xml/features/disallow-doctype-decl", F(Feature::DisallowDoctype));
        m.insert("jdk.xml.disallowDoctype", F(Feature::DisallowDoctype));

        m.insert("http://apache.org/xml/features/nonvalidating/load-external-dtd", F(Feature::LoadExternalDtd));
        m.insert("jdk.xml.loadExternalDtd", F(Feature::LoadExternalDtd));

        m.insert("http://xml.org/sax/features/external-general-entities", F(Feature::ExternalGeneralEntities));
        m.insert("jdk.xml.externalGeneralEntities", F(Feature::ExternalGeneralEntities));

        m.insert("http://xml.org/sax/features/external-parameter-entities", F(Feature::ExternalParameterEntities));
        m.insert("jdk.xml.externalParameterEntities", F(Feature::ExternalParameterEntities));
        m
    };
}

/// Resolve any accepted spelling to its canonical key
pub fn lookup(name: &str) -> Option<ConfigKey> {
    ALIASES.get(name).copied()
}

/// Resolve a spelling that must name a policy setting
pub fn lookup_setting(name: &str) -> Result<Setting> {
    match lookup(name) {
        Some(ConfigKey::Setting(setting)) => Ok(setting),
        _ => Err(Error::UnknownProperty(name.to_string())),
    }
}

/// Resolve a spelling that must name a feature
pub fn lookup_feature(name: &str) -> Result<Feature> {
    match lookup(name) {
        Some(ConfigKey::Feature(feature)) => Ok(feature),
        _ => Err(Error::UnknownProperty(name.to_string())),
    }
}

/// Every spelling of a key
pub fn aliases_of(key: ConfigKey) -> Vec<&'static str> {
    let mut names: Vec<_> = ALIASES
        .iter()
        .filter(|(_, k)| **k == key)
        .map(|(name, _)| *name)
        .collect();
    names.sort_unstable();
    names
}

/// A value passed through the property API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Integer limit
    Int(i32),
    /// String, e.g. a protocol list
    Str(String),
    /// Boolean
    Bool(bool),
    /// Absent value
    Null,
}

impl PropertyValue {
    /// Interpret as a limit; strings are parsed as decimal integers
    pub fn as_int(&self) -> Result<i32> {
        match self {
            PropertyValue::Int(n) => Ok(*n),
            PropertyValue::Str(s) => s
                .trim()
                .parse::<i32>()
                .map_err(|e| Error::Config(format!("'{}' is not a valid limit: {}", s, e))),
            other => Err(Error::Config(format!("expected an integer limit, got {:?}", other))),
        }
    }

    /// Interpret as a feature flag; strings must read `true` or `false`
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            PropertyValue::Bool(b) => Ok(*b),
            PropertyValue::Str(s) if s.trim().eq_ignore_ascii_case("true") => Ok(true),
            PropertyValue::Str(s) if s.trim().eq_ignore_ascii_case("false") => Ok(false),
            other => Err(Error::Config(format!("expected a boolean, got {:?}", other))),
        }
    }

    /// Interpret as an optional string
    pub fn as_opt_str(&self) -> Result<Option<&str>> {
        match self {
            PropertyValue::Str(s) => Ok(Some(s)),
            PropertyValue::Null => Ok(None),
            other => Err(Error::Config(format!("expected a string, got {:?}", other))),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(n) => write!(f, "{}", n),
            PropertyValue::Str(s) => write!(f, "{}", s),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Null => f.write_str("null"),
        }
    }
}

impl From<i32> for PropertyValue {
    fn from(n: i32) -> Self {
        PropertyValue::Int(n)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Str(s)
    }
}

impl From<Option<String>> for PropertyValue {
    fn from(s: Option<String>) -> Self {
        s.map(PropertyValue::Str).unwrap_or(PropertyValue::Null)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_key_has_legacy_and_current_spelling() {
        for setting in Setting::ALL {
            assert!(aliases_of(ConfigKey::Setting(setting)).len() >= 2, "{:?}", setting);
        }
        for feature in Feature::ALL {
            assert!(aliases_of(ConfigKey::Feature(feature)).len() >= 2, "{:?}", feature);
        }
    }

    #[test]
    fn test_aliases_share_one_key() {
        assert_eq!(
            lookup("http://apache.org/xml/properties/entity-expansion-limit"),
            lookup("http://www.oracle.com/xml/jaxp/properties/entityExpansionLimit")
        );
        assert_eq!(
            lookup_setting("jdk.xml.totalEntitySizeLimit").unwrap(),
            Setting::TotalEntitySizeLimit
        );
        assert!(lookup("http://example.com/nothing").is_none());
    }

    #[test]
    fn test_lookup_kind_mismatch() {
        assert!(matches!(
            lookup_feature("jdk.xml.maxOccur"),
            Err(Error::UnknownProperty(_))
        ));
    }

    #[test]
    fn test_property_value_as_int() {
        assert_eq!(PropertyValue::from(" 42 ").as_int().unwrap(), 42);
        assert_eq!(PropertyValue::Int(-1).as_int().unwrap(), -1);
        assert!(PropertyValue::from("lots").as_int().is_err());
        assert!(PropertyValue::Bool(true).as_int().is_err());
    }
}
