//! # xmlguard
//!
//! Resource-limit enforcement for XML parsing pipelines.
//!
//! This library decides which limits apply to a parse and enforces them
//! while DTDs and entities are processed: a limit policy resolved from ranked
//! configuration sources, entity size monitors for internal and external
//! entities, and protocol allow-lists for external fetches.
//!
//! ## Features
//!
//! - Entity expansion, entity size, attribute count, element depth and
//!   `maxOccurs` limits
//! - Secure-processing defaults for DOCTYPE and external-access gates
//! - Deployment properties file and process overrides
//! - Protocol allow-lists for external DTDs, entities and schemas
//! - A quick-xml based document guard
//!
//! ## Example
//!
//! ```rust,ignore
//! use xmlguard::{SecureConfiguration, SecureReader};
//!
//! let mut config = SecureConfiguration::new()?;
//! config.set_property("jdk.xml.maxGeneralEntitySizeLimit", 8)?;
//!
//! let report = SecureReader::new(&mut config).check_file("document.xml")?;
//! println!("{} entity expansions", report.entity_expansions);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Foundation
pub mod error;
pub mod limits;
pub mod settings;
pub mod reporter;

// Configuration sources and resolution
pub mod properties;
pub mod resolver;

// Enforcement
pub mod protocol;
pub mod dtd;
pub mod monitor;
pub mod config;
pub mod guard;

// Re-exports for convenience
pub use config::{AccessKind, SecureConfiguration};
pub use error::{Diagnostic, Error, Result, Severity};
pub use guard::{GuardReport, SecureReader};
pub use limits::{LimitPolicy, PolicyHandle, UNLIMITED};
pub use monitor::{EntityResolver, InputSource, ResourceIdentifier};
pub use reporter::{ErrorReporter, MessageKey};
pub use resolver::{ConfigResolver, ResolvedSetting, Source};
pub use settings::{Feature, PropertyValue, Setting};

/// Version of the xmlguard library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// XML Schema namespace
pub const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
