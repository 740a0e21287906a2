//! DTD events and the filter pipeline they travel through
//!
//! A DTD source (the internal-subset [`scanner`], or an external subset read
//! through the entity resolver) produces [`DtdEvent`]s in document order. A
//! [`DtdPipeline`] runs each event through an ordered list of [`DtdFilter`]
//! stages and hands the survivors to a terminal [`DtdHandler`].

pub mod entities;
pub mod pipeline;
pub mod scanner;

pub use entities::{EntityDecl, EntityKind, EntityTable};
pub use pipeline::DtdPipeline;
pub use scanner::{scan_subset, split_doctype, DoctypeDecl};

use crate::error::Result;

/// One declaration or structural marker inside a DTD
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtdEvent {
    /// Start of the DTD of a document
    StartDtd {
        /// Root element name
        root: String,
        /// Public identifier of the external subset
        public_id: Option<String>,
        /// System identifier of the external subset
        system_id: Option<String>,
    },
    /// An entity with a literal replacement text
    ///
    /// Parameter entity names carry a leading `%`.
    InternalEntityDecl {
        /// Entity name
        name: String,
        /// Replacement text, character references expanded
        text: String,
    },
    /// An entity whose replacement text lives in an external resource
    ExternalEntityDecl {
        /// Entity name
        name: String,
        /// Public identifier
        public_id: Option<String>,
        /// System identifier
        system_id: String,
        /// Base the system identifier is relative to
        base_system_id: Option<String>,
    },
    /// An unparsed entity (`NDATA`)
    UnparsedEntityDecl {
        /// Entity name
        name: String,
        /// Public identifier
        public_id: Option<String>,
        /// System identifier
        system_id: String,
        /// Notation name
        notation: String,
    },
    /// `<!ELEMENT ...>`
    ElementDecl {
        /// Element name
        name: String,
        /// Content model, verbatim
        content_model: String,
    },
    /// `<!ATTLIST ...>`
    AttlistDecl {
        /// Element the list applies to
        element: String,
        /// Attribute definitions, verbatim
        definitions: String,
    },
    /// `<!NOTATION ...>`
    NotationDecl {
        /// Notation name
        name: String,
        /// Public identifier
        public_id: Option<String>,
        /// System identifier
        system_id: Option<String>,
    },
    /// `<![INCLUDE[` or `<![IGNORE[`
    StartConditional {
        /// Whether the section is included
        include: bool,
    },
    /// `]]>` closing a conditional section
    EndConditional,
    /// A `%name;` reference between declarations
    ParameterEntityReference {
        /// Entity name, with its leading `%`
        name: String,
    },
    /// A comment
    Comment(String),
    /// A processing instruction
    ProcessingInstruction {
        /// PI target
        target: String,
        /// PI data
        data: String,
    },
    /// End of the DTD
    EndDtd,
}

impl DtdEvent {
    /// Short name of the event kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            DtdEvent::StartDtd { .. } => "start-dtd",
            DtdEvent::InternalEntityDecl { .. } => "internal-entity",
            DtdEvent::ExternalEntityDecl { .. } => "external-entity",
            DtdEvent::UnparsedEntityDecl { .. } => "unparsed-entity",
            DtdEvent::ElementDecl { .. } => "element",
            DtdEvent::AttlistDecl { .. } => "attlist",
            DtdEvent::NotationDecl { .. } => "notation",
            DtdEvent::StartConditional { .. } => "start-conditional",
            DtdEvent::EndConditional => "end-conditional",
            DtdEvent::ParameterEntityReference { .. } => "pe-reference",
            DtdEvent::Comment(_) => "comment",
            DtdEvent::ProcessingInstruction { .. } => "pi",
            DtdEvent::EndDtd => "end-dtd",
        }
    }
}

/// Whether an entity name denotes a parameter entity
pub fn is_parameter_entity(name: &str) -> bool {
    name.starts_with('%')
}

/// Terminal consumer of DTD events
pub trait DtdHandler {
    /// Consume one event
    fn handle(&mut self, event: DtdEvent) -> Result<()>;
}

/// A pipeline stage
///
/// Returning `Ok(None)` drops the event; every later stage and the handler
/// never see it.
pub trait DtdFilter: std::fmt::Debug {
    /// Process one event on its way downstream
    fn filter(&mut self, event: DtdEvent) -> Result<Option<DtdEvent>>;
}

/// Handler that keeps every event, in order
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventLog {
    /// Events received
    pub events: Vec<DtdEvent>,
}

impl DtdHandler for EventLog {
    fn handle(&mut self, event: DtdEvent) -> Result<()> {
        self.events.push(event);
        Ok(())
    }
}
