//! Configuration resolution
//!
//! Computes the effective value of every limit and gate from ranked sources.
//!
//! Numeric limits, highest precedence first:
//!
//! 1. a field the caller customized on a supplied [`LimitPolicy`]
//! 2. a value passed through the property API
//! 3. the deployment properties file
//! 4. the per-process properties
//! 5. the compiled default
//!
//! External-access gates (load external DTD, external general and parameter
//! entities, the two protocol allow-lists) follow the secure-processing
//! toggle instead: with it off every gate is open and neither file nor
//! process properties are consulted; with it on, the
//! `jdk.xml.resolveExternalEntities` switch opens or closes all of them, and
//! closed is the default. Caller values always win.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::Result;
use crate::limits::{
    LimitPolicy, ACCESS_ALL, ACCESS_NONE, DEFAULT_ELEMENT_ATTRIBUTE_LIMIT,
    DEFAULT_GENERAL_ENTITY_SIZE_LIMIT, DEFAULT_MAX_ELEMENT_DEPTH,
    DEFAULT_PARAMETER_ENTITY_SIZE_LIMIT, DEFAULT_TOTAL_ENTITY_SIZE_LIMIT, UNLIMITED,
};
use crate::properties::{MapProperties, PropertiesCache, PropertySource};
use crate::settings::{Feature, PropertyValue, Setting};

/// Process property that opens or closes every external-access gate
pub const RESOLVE_EXTERNAL_ENTITIES: &str = "jdk.xml.resolveExternalEntities";

/// Entity expansion limit of a resolved configuration
pub const CONFIG_ENTITY_EXPANSION_LIMIT: i32 = 64_000;

/// `maxOccurs` limit of a resolved configuration
pub const CONFIG_MAX_OCCUR_LIMIT: i32 = 5_000;

/// Compiled default of a setting when no source supplies one
pub fn compiled_default(setting: Setting) -> PropertyValue {
    match setting {
        Setting::EntityExpansionLimit => PropertyValue::Int(CONFIG_ENTITY_EXPANSION_LIMIT),
        Setting::ElementAttributeLimit => PropertyValue::Int(DEFAULT_ELEMENT_ATTRIBUTE_LIMIT),
        Setting::MaxElementDepth => PropertyValue::Int(DEFAULT_MAX_ELEMENT_DEPTH),
        Setting::MaxOccurLimit => PropertyValue::Int(CONFIG_MAX_OCCUR_LIMIT),
        Setting::GeneralEntitySizeLimit => PropertyValue::Int(DEFAULT_GENERAL_ENTITY_SIZE_LIMIT),
        Setting::ParameterEntitySizeLimit => PropertyValue::Int(DEFAULT_PARAMETER_ENTITY_SIZE_LIMIT),
        Setting::TotalEntitySizeLimit => PropertyValue::Int(DEFAULT_TOTAL_ENTITY_SIZE_LIMIT),
        Setting::AccessExternalDtd | Setting::AccessExternalSchema => ACCESS_ALL.into(),
    }
}

/// Where an effective value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// A field customized on the caller's limit policy
    CallerPolicy,
    /// The property or feature API
    CallerProperty,
    /// The deployment properties file
    DeploymentFile,
    /// The per-process properties
    ProcessProperty,
    /// Derived from the secure-processing toggle
    SecureProcessing,
    /// Compiled default
    Default,
}

impl Source {
    /// Whether the value was supplied from outside the compiled defaults
    pub fn is_external(&self) -> bool {
        !matches!(self, Source::SecureProcessing | Source::Default)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::CallerPolicy => "caller policy",
            Source::CallerProperty => "caller property",
            Source::DeploymentFile => "deployment file",
            Source::ProcessProperty => "process property",
            Source::SecureProcessing => "secure processing",
            Source::Default => "default",
        };
        f.write_str(s)
    }
}

/// A value with the source that supplied it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedSetting<T> {
    /// Effective value
    pub value: T,
    /// Supplying source
    pub source: Source,
}

impl<T> ResolvedSetting<T> {
    /// Create a resolved value
    pub fn new(value: T, source: Source) -> Self {
        Self { value, source }
    }

    /// Whether an external source explicitly specified the value
    pub fn specified(&self) -> bool {
        self.source.is_external()
    }
}

/// Values set by the caller through the property and feature API
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerOverrides {
    /// Settings passed as properties
    pub settings: HashMap<Setting, PropertyValue>,
    /// Features set explicitly
    pub features: HashMap<Feature, bool>,
}

impl CallerOverrides {
    /// Whether secure processing is on; it is unless the caller turned it off
    pub fn secure_processing(&self) -> bool {
        self.features
            .get(&Feature::SecureProcessing)
            .copied()
            .unwrap_or(true)
    }
}

/// One line of an effective-settings report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveSetting {
    /// Property name or feature URI
    pub name: &'static str,
    /// Effective value
    pub value: PropertyValue,
    /// Supplying source
    pub source: Source,
}

/// Output of one resolution pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// Every policy setting
    pub settings: IndexMap<Setting, ResolvedSetting<PropertyValue>>,
    /// Every feature
    pub features: IndexMap<Feature, ResolvedSetting<bool>>,
}

impl Resolution {
    /// Effective value of a feature
    pub fn feature(&self, feature: Feature) -> bool {
        self.features
            .get(&feature)
            .map(|r| r.value)
            .unwrap_or(false)
    }

    /// Effective value of a setting
    pub fn setting(&self, setting: Setting) -> Option<&PropertyValue> {
        self.settings.get(&setting).map(|r| &r.value)
    }

    /// Every setting, then every feature, with its source
    pub fn effective_settings(&self) -> Vec<EffectiveSetting> {
        let settings = self.settings.iter().map(|(setting, r)| EffectiveSetting {
            name: setting.system_property_name(),
            value: r.value.clone(),
            source: r.source,
        });
        let features = self.features.iter().map(|(feature, r)| EffectiveSetting {
            name: feature.uri(),
            value: PropertyValue::Bool(r.value),
            source: r.source,
        });
        settings.chain(features).collect()
    }

    /// Write every value not owned by the caller's policy into it
    pub fn apply_to(&self, policy: &mut LimitPolicy) -> Result<()> {
        for (setting, resolved) in &self.settings {
            if resolved.source != Source::CallerPolicy {
                policy.apply_resolved(*setting, &resolved.value)?;
            }
        }
        Ok(())
    }
}

/// Ranks configuration sources and computes effective values
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    deployment: Arc<dyn PropertySource>,
    process: Arc<dyn PropertySource>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    /// Resolver over the global deployment file and a fresh environment snapshot
    pub fn new() -> Self {
        let names = Setting::ALL
            .iter()
            .map(|s| s.system_property_name())
            .chain(std::iter::once(RESOLVE_EXTERNAL_ENTITIES));
        Self {
            deployment: PropertiesCache::global(),
            process: Arc::new(MapProperties::from_env(names)),
        }
    }

    /// Resolver over explicit sources
    pub fn with_sources(deployment: Arc<dyn PropertySource>, process: Arc<dyn PropertySource>) -> Self {
        Self { deployment, process }
    }

    /// Raw value of a named property, from the highest source that has it
    fn raw_candidates(&self, name: &str) -> Vec<(String, Source)> {
        let mut found = Vec::with_capacity(2);
        if let Some(value) = self.deployment.property(name) {
            found.push((value, Source::DeploymentFile));
        }
        if let Some(value) = self.process.property(name) {
            found.push((value, Source::ProcessProperty));
        }
        found
    }

    /// Resolve a numeric property from the file, process and default sources
    ///
    /// A value that does not parse is skipped in favor of the next source.
    /// Zero and negative values mean "no limit".
    pub fn resolve_limit(&self, name: &str, default: i32) -> ResolvedSetting<i32> {
        for (raw, source) in self.raw_candidates(name) {
            match raw.trim().parse::<i32>() {
                Ok(n) => {
                    trace!(name, value = n, %source, "numeric property found");
                    let value = if n > 0 { n } else { UNLIMITED };
                    return ResolvedSetting::new(value, source);
                }
                Err(e) => {
                    debug!(name, value = %raw, %source, error = %e, "ignoring malformed numeric property");
                }
            }
        }
        ResolvedSetting::new(default, Source::Default)
    }

    /// Resolve a string property from the file, process and default sources
    pub fn resolve_string(&self, name: &str, default: &str) -> ResolvedSetting<String> {
        match self.raw_candidates(name).into_iter().next() {
            Some((value, source)) => ResolvedSetting::new(value, source),
            None => ResolvedSetting::new(default.to_string(), Source::Default),
        }
    }

    /// Resolve a boolean property; only `true` (any case) is true
    pub fn resolve_bool(&self, name: &str, default: bool) -> ResolvedSetting<bool> {
        match self.raw_candidates(name).into_iter().next() {
            Some((value, source)) => {
                ResolvedSetting::new(value.trim().eq_ignore_ascii_case("true"), source)
            }
            None => ResolvedSetting::new(default, Source::Default),
        }
    }

    /// Run one full resolution pass
    pub fn resolve(&self, overrides: &CallerOverrides, policy: &LimitPolicy) -> Result<Resolution> {
        let secure = overrides.secure_processing();
        let mut settings = IndexMap::new();
        let mut features = IndexMap::new();

        features.insert(
            Feature::SecureProcessing,
            match overrides.features.get(&Feature::SecureProcessing) {
                Some(value) => ResolvedSetting::new(*value, Source::CallerProperty),
                None => ResolvedSetting::new(true, Source::Default),
            },
        );

        for setting in Setting::LIMITS {
            let resolved = if policy.is_customized(setting) {
                ResolvedSetting::new(policy.value(setting), Source::CallerPolicy)
            } else if let Some(value) = overrides.settings.get(&setting) {
                let limit = crate::limits::normalize(value.as_int()?);
                ResolvedSetting::new(PropertyValue::Int(limit), Source::CallerProperty)
            } else {
                let default = compiled_default(setting).as_int()?;
                let r = self.resolve_limit(setting.system_property_name(), default);
                ResolvedSetting::new(PropertyValue::Int(r.value), r.source)
            };
            debug!(%setting, value = %resolved.value, source = %resolved.source, "resolved limit");
            settings.insert(setting, resolved);
        }

        // One switch decides every gate when secure processing is on.
        let gate = if secure {
            let switch = self.resolve_bool(RESOLVE_EXTERNAL_ENTITIES, false);
            let source = if switch.specified() { switch.source } else { Source::SecureProcessing };
            ResolvedSetting::new(switch.value, source)
        } else {
            ResolvedSetting::new(true, Source::SecureProcessing)
        };

        for feature in [
            Feature::LoadExternalDtd,
            Feature::ExternalGeneralEntities,
            Feature::ExternalParameterEntities,
        ] {
            let resolved = match overrides.features.get(&feature) {
                Some(value) => ResolvedSetting::new(*value, Source::CallerProperty),
                None => gate.clone(),
            };
            debug!(%feature, value = resolved.value, source = %resolved.source, "resolved feature");
            features.insert(feature, resolved);
        }

        for setting in [Setting::AccessExternalDtd, Setting::AccessExternalSchema] {
            let resolved = if policy.is_customized(setting) {
                ResolvedSetting::new(policy.value(setting), Source::CallerPolicy)
            } else if let Some(value) = overrides.settings.get(&setting) {
                ResolvedSetting::new(value.clone(), Source::CallerProperty)
            } else {
                let derived = if gate.value { ACCESS_ALL } else { ACCESS_NONE };
                if secure {
                    let r = self.resolve_string(setting.system_property_name(), derived);
                    if r.specified() {
                        ResolvedSetting::new(PropertyValue::Str(r.value), r.source)
                    } else {
                        ResolvedSetting::new(derived.into(), gate.source)
                    }
                } else {
                    ResolvedSetting::new(derived.into(), gate.source)
                }
            };
            debug!(%setting, value = %resolved.value, source = %resolved.source, "resolved access");
            settings.insert(setting, resolved);
        }

        features.insert(
            Feature::DisallowDoctype,
            match overrides.features.get(&Feature::DisallowDoctype) {
                Some(value) => ResolvedSetting::new(*value, Source::CallerProperty),
                None => ResolvedSetting::new(secure, Source::SecureProcessing),
            },
        );

        Ok(Resolution { settings, features })
    }
}
