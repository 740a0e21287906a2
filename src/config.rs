//! Secure parser configuration
//!
//! [`SecureConfiguration`] is what a parser holds: the limit policy, the
//! feature flags, the caller's overrides and the hooks a parse needs (DTD
//! pipeline, monitored entity resolver, access checks, reporter). Every
//! mutation of a tracked property re-runs the resolver.

use std::sync::Arc;

use tracing::debug;

use crate::dtd::{DtdHandler, DtdPipeline};
use crate::error::{Diagnostic, Error, Result};
use crate::limits::{LimitPolicy, PolicyHandle, ACCESS_ALL};
use crate::monitor::{EntityCounter, EntityResolver, ExternalEntityMonitor, InternalEntityMonitor};
use crate::protocol::check_access;
use crate::reporter::{LoggingReporter, MessageKey, SharedReporter};
use crate::resolver::{CallerOverrides, ConfigResolver, EffectiveSetting, Resolution, Source};
use crate::settings::{lookup, lookup_feature, ConfigKey, Feature, PropertyValue};

/// Kind of external resource being fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// An external DTD subset or parameter entity
    Dtd,
    /// An external general entity
    Entity,
    /// A schema document
    Schema,
}

impl AccessKind {
    fn message_key(self) -> MessageKey {
        match self {
            AccessKind::Dtd => MessageKey::AccessExternalDtd,
            AccessKind::Entity => MessageKey::AccessExternalEntity,
            AccessKind::Schema => MessageKey::AccessExternalSchema,
        }
    }
}

/// Limits, features and parse hooks of one parser
#[derive(Debug)]
pub struct SecureConfiguration {
    resolver: ConfigResolver,
    overrides: CallerOverrides,
    resolution: Resolution,
    policy: PolicyHandle,
    entity_resolver: Option<Arc<dyn EntityResolver>>,
    reporter: SharedReporter,
    counter: EntityCounter,
}

impl SecureConfiguration {
    /// Configuration over the process environment and deployment file
    pub fn new() -> Result<Self> {
        Self::with_resolver(ConfigResolver::new())
    }

    /// Configuration over explicit sources
    pub fn with_resolver(resolver: ConfigResolver) -> Result<Self> {
        let policy = PolicyHandle::new(LimitPolicy::default());
        let overrides = CallerOverrides::default();
        let resolution = resolver.resolve(&overrides, &policy.read())?;
        resolution.apply_to(&mut policy.write())?;
        Ok(Self {
            resolver,
            overrides,
            resolution,
            policy,
            entity_resolver: None,
            reporter: Arc::new(LoggingReporter),
            counter: EntityCounter::new(),
        })
    }

    /// Re-run resolution and refill every field the caller does not own
    pub fn reconfigure(&mut self) -> Result<()> {
        let resolution = self.resolver.resolve(&self.overrides, &self.policy.read())?;
        resolution.apply_to(&mut self.policy.write())?;
        debug!(secure = resolution.feature(Feature::SecureProcessing), "configuration resolved");
        self.resolution = resolution;
        Ok(())
    }

    /// Set a feature by any of its names
    pub fn set_feature(&mut self, name: &str, value: bool) -> Result<()> {
        let feature = lookup_feature(name)?;
        self.overrides.features.insert(feature, value);
        self.reconfigure()
    }

    /// Read a feature by any of its names
    pub fn feature(&self, name: &str) -> Result<bool> {
        Ok(self.is_enabled(lookup_feature(name)?))
    }

    /// Effective value of a feature
    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.resolution.feature(feature)
    }

    /// Whether secure processing is on
    pub fn secure_processing(&self) -> bool {
        self.is_enabled(Feature::SecureProcessing)
    }

    /// Set a limit, access list or feature by any of its names
    ///
    /// A property set here takes over from an earlier customization of the
    /// same field on the policy.
    pub fn set_property(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let value = value.into();
        match lookup(name).ok_or_else(|| Error::UnknownProperty(name.to_string()))? {
            ConfigKey::Setting(setting) => {
                let value = if setting.is_numeric() {
                    PropertyValue::Int(value.as_int()?)
                } else {
                    value.as_opt_str()?.map_or(PropertyValue::Null, PropertyValue::from)
                };
                self.overrides.settings.insert(setting, value);
                self.policy.write().uncustomize(setting);
                self.reconfigure()
            }
            ConfigKey::Feature(feature) => {
                self.overrides.features.insert(feature, value.as_bool()?);
                self.reconfigure()
            }
        }
    }

    /// Read a limit, access list or feature by any of its names
    pub fn property(&self, name: &str) -> Result<PropertyValue> {
        match lookup(name).ok_or_else(|| Error::UnknownProperty(name.to_string()))? {
            ConfigKey::Setting(setting) => Ok(self.policy.read().value(setting)),
            ConfigKey::Feature(feature) => Ok(PropertyValue::Bool(self.is_enabled(feature))),
        }
    }

    /// Install a caller policy; fields it did not customize are refilled
    pub fn set_limit_policy(&mut self, policy: impl Into<PolicyHandle>) -> Result<()> {
        self.policy = policy.into();
        self.reconfigure()
    }

    /// Shared handle to the live policy
    pub fn limit_policy(&self) -> PolicyHandle {
        self.policy.clone()
    }

    /// Install the resolver used for external entities
    pub fn set_entity_resolver(&mut self, resolver: Option<Arc<dyn EntityResolver>>) {
        self.entity_resolver = resolver;
    }

    /// The installed resolver, wrapped so that what it returns is counted
    pub fn entity_resolver(&self) -> ExternalEntityMonitor {
        ExternalEntityMonitor::new(
            self.entity_resolver.clone(),
            self.policy.clone(),
            self.counter.clone(),
            self.reporter.clone(),
        )
    }

    /// Install the diagnostic sink
    pub fn set_reporter(&mut self, reporter: SharedReporter) {
        self.reporter = reporter;
    }

    /// The diagnostic sink
    pub fn reporter(&self) -> SharedReporter {
        self.reporter.clone()
    }

    /// Start a parse: reset the entity counter and build a DTD pipeline
    ///
    /// The internal entity monitor is stage 0.
    pub fn configure_pipeline<H: DtdHandler>(&mut self, sink: H) -> DtdPipeline<H> {
        self.counter = EntityCounter::new();
        let mut pipeline = DtdPipeline::new(sink);
        pipeline.insert(0, Box::new(InternalEntityMonitor::new(
            self.policy.clone(),
            self.counter.clone(),
            self.reporter.clone(),
        )));
        debug!(stages = pipeline.len(), "DTD pipeline configured");
        pipeline
    }

    /// Entity text counter of the current parse
    pub fn counter(&self) -> &EntityCounter {
        &self.counter
    }

    /// Gate a fetch of `system_id` on the matching allow-list
    ///
    /// The list is read from the live policy, so a setter call on the policy
    /// after resolution takes effect here.
    pub fn check_external_access(&self, kind: AccessKind, system_id: Option<&str>) -> Result<()> {
        let allowed = {
            let policy = self.policy.read();
            match kind {
                AccessKind::Dtd | AccessKind::Entity => policy.access_external_dtd().map(str::to_string),
                AccessKind::Schema => policy.access_external_schema().map(str::to_string),
            }
        };
        let protocol = match check_access(system_id, allowed.as_deref(), ACCESS_ALL)? {
            Some(protocol) => protocol,
            None => return Ok(()),
        };
        let diag = Diagnostic::fatal(kind.message_key())
            .with_arg(system_id.unwrap_or_default())
            .with_arg(protocol);
        self.raise(diag)
    }

    /// Report a diagnostic and fail, whatever the reporter decides
    pub(crate) fn raise(&self, diagnostic: Diagnostic) -> Result<()> {
        self.reporter.report(diagnostic.clone())?;
        Err(Error::Fatal(diagnostic))
    }

    /// The last resolution pass
    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// Effective values and their sources, with live policy values
    pub fn effective_settings(&self) -> Vec<EffectiveSetting> {
        let policy = self.policy.read();
        self.resolution
            .effective_settings()
            .into_iter()
            .map(|mut entry| {
                let setting = self
                    .resolution
                    .settings
                    .keys()
                    .find(|s| s.system_property_name() == entry.name);
                if let Some(setting) = setting {
                    let live = policy.value(*setting);
                    if live != entry.value {
                        entry.value = live;
                        entry.source = Source::CallerPolicy;
                    }
                }
                entry
            })
            .collect()
    }
}
