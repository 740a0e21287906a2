//! Limit policy
//!
//! This module holds the security-relevant limits consulted while parsing
//! DTDs, documents and schemas, protecting against entity expansion
//! ("billion laughs"), oversized attribute lists, unbounded element depth and
//! unrestricted external-resource fetches.
//!
//! Every numeric setter normalizes its input: a positive value is stored as
//! is, `0` means "no limit" and is stored as [`UNLIMITED`], and a negative
//! value is stored as `0`, which rejects on first use.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::error::{Diagnostic, Error, Result};
use crate::reporter::MessageKey;
use crate::settings::{PropertyValue, Setting};

/// Stored value meaning "no limit"
pub const UNLIMITED: i32 = i32::MAX;

/// Allow-list value permitting every protocol
pub const ACCESS_ALL: &str = "all";

/// Allow-list value permitting no protocol
pub const ACCESS_NONE: &str = "";

/// Default maximum number of entity expansions
pub const DEFAULT_ENTITY_EXPANSION_LIMIT: i32 = 100_000;
/// Default maximum number of attributes per element
pub const DEFAULT_ELEMENT_ATTRIBUTE_LIMIT: i32 = 10_000;
/// Default maximum element depth
pub const DEFAULT_MAX_ELEMENT_DEPTH: i32 = UNLIMITED;
/// Default maximum `maxOccurs` value
pub const DEFAULT_MAX_OCCUR_LIMIT: i32 = 3_000;
/// Default maximum size of a general entity
pub const DEFAULT_GENERAL_ENTITY_SIZE_LIMIT: i32 = UNLIMITED;
/// Default maximum size of a parameter entity
pub const DEFAULT_PARAMETER_ENTITY_SIZE_LIMIT: i32 = 1_000_000;
/// Default maximum accumulated entity size
pub const DEFAULT_TOTAL_ENTITY_SIZE_LIMIT: i32 = 50_000_000;

/// Apply the setter normalization rule
pub fn normalize(limit: i32) -> i32 {
    if limit > 0 {
        limit
    } else if limit == 0 {
        UNLIMITED
    } else {
        0
    }
}

/// Whether an observed quantity exceeds a stored limit
pub fn exceeds(limit: i32, observed: u64) -> bool {
    observed > u64::try_from(limit).unwrap_or(0)
}

/// Security limits for one parser configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitPolicy {
    entity_expansion_limit: i32,
    element_attribute_limit: i32,
    max_element_depth: i32,
    max_occurs_limit: i32,
    general_entity_size_limit: i32,
    parameter_entity_size_limit: i32,
    total_entity_size_limit: i32,
    access_external_dtd: Option<String>,
    access_external_schema: Option<String>,
    /// Fields set through a public setter, indexed by `Setting`
    #[serde(skip)]
    customized: [bool; 9],
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            entity_expansion_limit: DEFAULT_ENTITY_EXPANSION_LIMIT,
            element_attribute_limit: DEFAULT_ELEMENT_ATTRIBUTE_LIMIT,
            max_element_depth: DEFAULT_MAX_ELEMENT_DEPTH,
            max_occurs_limit: DEFAULT_MAX_OCCUR_LIMIT,
            general_entity_size_limit: DEFAULT_GENERAL_ENTITY_SIZE_LIMIT,
            parameter_entity_size_limit: DEFAULT_PARAMETER_ENTITY_SIZE_LIMIT,
            total_entity_size_limit: DEFAULT_TOTAL_ENTITY_SIZE_LIMIT,
            access_external_dtd: Some(ACCESS_ALL.to_string()),
            access_external_schema: Some(ACCESS_ALL.to_string()),
            customized: [false; 9],
        }
    }
}

impl LimitPolicy {
    /// Create a policy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy with every numeric limit lifted
    pub fn unlimited() -> Self {
        let mut policy = Self::default();
        for setting in Setting::LIMITS {
            policy.store_limit(setting, UNLIMITED);
        }
        policy
    }

    /// Maximum number of entity expansions
    pub fn entity_expansion_limit(&self) -> i32 {
        self.entity_expansion_limit
    }

    /// Set the maximum number of entity expansions
    pub fn set_entity_expansion_limit(&mut self, limit: i32) {
        self.set_limit(Setting::EntityExpansionLimit, limit);
    }

    /// Maximum number of attributes per element
    pub fn element_attribute_limit(&self) -> i32 {
        self.element_attribute_limit
    }

    /// Set the maximum number of attributes per element
    pub fn set_element_attribute_limit(&mut self, limit: i32) {
        self.set_limit(Setting::ElementAttributeLimit, limit);
    }

    /// Maximum element depth
    pub fn max_element_depth(&self) -> i32 {
        self.max_element_depth
    }

    /// Set the maximum element depth
    pub fn set_max_element_depth(&mut self, limit: i32) {
        self.set_limit(Setting::MaxElementDepth, limit);
    }

    /// Maximum `maxOccurs` value
    pub fn max_occurs_limit(&self) -> i32 {
        self.max_occurs_limit
    }

    /// Set the maximum `maxOccurs` value
    pub fn set_max_occurs_limit(&mut self, limit: i32) {
        self.set_limit(Setting::MaxOccurLimit, limit);
    }

    /// Maximum size of one general entity
    pub fn general_entity_size_limit(&self) -> i32 {
        self.general_entity_size_limit
    }

    /// Set the maximum size of one general entity
    pub fn set_general_entity_size_limit(&mut self, limit: i32) {
        self.set_limit(Setting::GeneralEntitySizeLimit, limit);
    }

    /// Maximum size of one parameter entity
    pub fn parameter_entity_size_limit(&self) -> i32 {
        self.parameter_entity_size_limit
    }

    /// Set the maximum size of one parameter entity
    pub fn set_parameter_entity_size_limit(&mut self, limit: i32) {
        self.set_limit(Setting::ParameterEntitySizeLimit, limit);
    }

    /// Maximum accumulated entity size
    pub fn total_entity_size_limit(&self) -> i32 {
        self.total_entity_size_limit
    }

    /// Set the maximum accumulated entity size
    pub fn set_total_entity_size_limit(&mut self, limit: i32) {
        self.set_limit(Setting::TotalEntitySizeLimit, limit);
    }

    /// Protocols allowed for external DTDs and entities
    pub fn access_external_dtd(&self) -> Option<&str> {
        self.access_external_dtd.as_deref()
    }

    /// Set the protocols allowed for external DTDs and entities, stored verbatim
    pub fn set_access_external_dtd(&mut self, protocols: Option<&str>) {
        self.store_access(Setting::AccessExternalDtd, protocols.map(str::to_string));
        self.customized[Setting::AccessExternalDtd.index()] = true;
    }

    /// Protocols allowed for external schemas
    pub fn access_external_schema(&self) -> Option<&str> {
        self.access_external_schema.as_deref()
    }

    /// Set the protocols allowed for external schemas, stored verbatim
    pub fn set_access_external_schema(&mut self, protocols: Option<&str>) {
        self.store_access(Setting::AccessExternalSchema, protocols.map(str::to_string));
        self.customized[Setting::AccessExternalSchema.index()] = true;
    }

    /// Read any numeric limit
    pub fn limit(&self, setting: Setting) -> Option<i32> {
        match setting {
            Setting::EntityExpansionLimit => Some(self.entity_expansion_limit),
            Setting::ElementAttributeLimit => Some(self.element_attribute_limit),
            Setting::MaxElementDepth => Some(self.max_element_depth),
            Setting::MaxOccurLimit => Some(self.max_occurs_limit),
            Setting::GeneralEntitySizeLimit => Some(self.general_entity_size_limit),
            Setting::ParameterEntitySizeLimit => Some(self.parameter_entity_size_limit),
            Setting::TotalEntitySizeLimit => Some(self.total_entity_size_limit),
            Setting::AccessExternalDtd | Setting::AccessExternalSchema => None,
        }
    }

    /// Set any numeric limit through the normalizing path; string settings are ignored
    pub fn set_limit(&mut self, setting: Setting, limit: i32) {
        if setting.is_numeric() {
            self.store_limit(setting, normalize(limit));
            self.customized[setting.index()] = true;
        }
    }

    /// Read any setting as a property value
    pub fn value(&self, setting: Setting) -> PropertyValue {
        match setting {
            Setting::AccessExternalDtd => self.access_external_dtd.clone().into(),
            Setting::AccessExternalSchema => self.access_external_schema.clone().into(),
            numeric => self.limit(numeric).map_or(PropertyValue::Null, PropertyValue::Int),
        }
    }

    /// Set any setting from a property value, as the property API does
    pub fn set_value(&mut self, setting: Setting, value: &PropertyValue) -> Result<()> {
        match setting {
            Setting::AccessExternalDtd => self.set_access_external_dtd(value.as_opt_str()?),
            Setting::AccessExternalSchema => self.set_access_external_schema(value.as_opt_str()?),
            numeric => self.set_limit(numeric, value.as_int()?),
        }
        Ok(())
    }

    /// Whether a field was set through a public setter
    pub fn is_customized(&self, setting: Setting) -> bool {
        self.customized[setting.index()]
    }

    /// Forget which fields were set through public setters
    pub fn clear_customized(&mut self) {
        self.customized = [false; 9];
    }

    /// Forget that one field was set through a public setter
    pub(crate) fn uncustomize(&mut self, setting: Setting) {
        self.customized[setting.index()] = false;
    }

    /// Store a resolved value without marking the field as customized
    pub(crate) fn apply_resolved(&mut self, setting: Setting, value: &PropertyValue) -> Result<()> {
        match setting {
            Setting::AccessExternalDtd | Setting::AccessExternalSchema => {
                self.store_access(setting, value.as_opt_str()?.map(str::to_string));
            }
            numeric => self.store_limit(numeric, normalize(value.as_int()?)),
        }
        Ok(())
    }

    fn store_limit(&mut self, setting: Setting, limit: i32) {
        let field = match setting {
            Setting::EntityExpansionLimit => &mut self.entity_expansion_limit,
            Setting::ElementAttributeLimit => &mut self.element_attribute_limit,
            Setting::MaxElementDepth => &mut self.max_element_depth,
            Setting::MaxOccurLimit => &mut self.max_occurs_limit,
            Setting::GeneralEntitySizeLimit => &mut self.general_entity_size_limit,
            Setting::ParameterEntitySizeLimit => &mut self.parameter_entity_size_limit,
            Setting::TotalEntitySizeLimit => &mut self.total_entity_size_limit,
            Setting::AccessExternalDtd | Setting::AccessExternalSchema => return,
        };
        *field = limit;
    }

    fn store_access(&mut self, setting: Setting, protocols: Option<String>) {
        match setting {
            Setting::AccessExternalDtd => self.access_external_dtd = protocols,
            Setting::AccessExternalSchema => self.access_external_schema = protocols,
            _ => {}
        }
    }

    /// Check the number of entity expansions seen so far
    pub fn check_entity_expansions(&self, count: u64) -> Option<Diagnostic> {
        exceeds(self.entity_expansion_limit, count).then(|| {
            Diagnostic::fatal(MessageKey::EntityExpansionLimitExceeded)
                .with_arg(self.entity_expansion_limit)
        })
    }

    /// Check the attribute count of one element
    pub fn check_attributes(&self, element: &str, count: u64) -> Option<Diagnostic> {
        exceeds(self.element_attribute_limit, count).then(|| {
            Diagnostic::fatal(MessageKey::ElementAttributeLimit)
                .with_arg(element)
                .with_arg(self.element_attribute_limit)
        })
    }

    /// Check the depth of an element
    pub fn check_element_depth(&self, element: &str, depth: u64) -> Option<Diagnostic> {
        exceeds(self.max_element_depth, depth).then(|| {
            Diagnostic::fatal(MessageKey::MaxElementDepthLimit)
                .with_arg(element)
                .with_arg(i64::try_from(depth).unwrap_or(i64::MAX))
                .with_arg(self.max_element_depth)
        })
    }

    /// Check a `maxOccurs` value
    pub fn check_max_occurs(&self, max_occurs: u64) -> Option<Diagnostic> {
        exceeds(self.max_occurs_limit, max_occurs).then(|| {
            Diagnostic::fatal(MessageKey::MaxOccurLimit).with_arg(self.max_occurs_limit)
        })
    }
}

/// Shared reference to the limit policy of one configuration
///
/// The configuration, its monitors and the caller all hold clones of the same
/// handle; replacing the policy through one clone is seen by every other.
#[derive(Debug, Clone, Default)]
pub struct PolicyHandle(Arc<RwLock<LimitPolicy>>);

impl PolicyHandle {
    /// Wrap a policy
    pub fn new(policy: LimitPolicy) -> Self {
        Self(Arc::new(RwLock::new(policy)))
    }

    /// Borrow the policy for reading
    pub fn read(&self) -> RwLockReadGuard<'_, LimitPolicy> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow the policy for writing
    pub fn write(&self) -> RwLockWriteGuard<'_, LimitPolicy> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current policy
    pub fn snapshot(&self) -> LimitPolicy {
        self.read().clone()
    }

    /// Replace the policy wholesale
    pub fn replace(&self, policy: LimitPolicy) {
        *self.write() = policy;
    }

    /// Whether two handles share one policy
    pub fn ptr_eq(&self, other: &PolicyHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<LimitPolicy> for PolicyHandle {
    fn from(policy: LimitPolicy) -> Self {
        Self::new(policy)
    }
}

/// Raise the first diagnostic of a check, if any, as an error
pub fn fail_on(diagnostic: Option<Diagnostic>) -> Result<()> {
    match diagnostic {
        Some(diag) => Err(Error::Fatal(diag)),
        None => Ok(()),
    }
}
