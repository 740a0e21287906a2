//! Entity table built from DTD events

use indexmap::IndexMap;
use tracing::debug;

use super::{is_parameter_entity, DtdEvent, DtdHandler};
use crate::error::Result;

/// How an entity's replacement text is obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    /// Literal text
    Internal(String),
    /// Text read from an external resource
    External {
        /// Public identifier
        public_id: Option<String>,
        /// System identifier
        system_id: String,
        /// Base for a relative system identifier
        base_system_id: Option<String>,
    },
    /// Binary data referenced through a notation
    Unparsed {
        /// System identifier
        system_id: String,
        /// Notation name
        notation: String,
    },
}

/// A declared entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDecl {
    /// Name, with a leading `%` for parameter entities
    pub name: String,
    /// Replacement source
    pub kind: EntityKind,
}

impl EntityDecl {
    /// Whether this is a parameter entity
    pub fn is_parameter(&self) -> bool {
        is_parameter_entity(&self.name)
    }

    /// Whether the replacement text is external
    pub fn is_external(&self) -> bool {
        matches!(self.kind, EntityKind::External { .. })
    }
}

/// Declarations collected from a DTD
///
/// The first declaration of a name is binding; later ones are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityTable {
    entities: IndexMap<String, EntityDecl>,
    elements: Vec<String>,
    notations: Vec<String>,
}

impl EntityTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a general entity by name
    pub fn general(&self, name: &str) -> Option<&EntityDecl> {
        self.entities.get(name)
    }

    /// Look up a parameter entity by name, with or without its `%`
    pub fn parameter(&self, name: &str) -> Option<&EntityDecl> {
        if is_parameter_entity(name) {
            self.entities.get(name)
        } else {
            self.entities.get(&format!("%{}", name))
        }
    }

    /// Every declared entity, in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &EntityDecl> {
        self.entities.values()
    }

    /// Number of declared entities
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entity was declared
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Declared element names
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// Declared notation names
    pub fn notations(&self) -> &[String] {
        &self.notations
    }

    fn declare(&mut self, decl: EntityDecl) {
        if self.entities.contains_key(&decl.name) {
            debug!(name = %decl.name, "ignoring redeclared entity");
            return;
        }
        self.entities.insert(decl.name.clone(), decl);
    }
}

impl DtdHandler for EntityTable {
    fn handle(&mut self, event: DtdEvent) -> Result<()> {
        match event {
            DtdEvent::InternalEntityDecl { name, text } => self.declare(EntityDecl {
                name,
                kind: EntityKind::Internal(text),
            }),
            DtdEvent::ExternalEntityDecl {
                name,
                public_id,
                system_id,
                base_system_id,
            } => self.declare(EntityDecl {
                name,
                kind: EntityKind::External {
                    public_id,
                    system_id,
                    base_system_id,
                },
            }),
            DtdEvent::UnparsedEntityDecl {
                name,
                system_id,
                notation,
                ..
            } => self.declare(EntityDecl {
                name,
                kind: EntityKind::Unparsed { system_id, notation },
            }),
            DtdEvent::ElementDecl { name, .. } => self.elements.push(name),
            DtdEvent::NotationDecl { name, .. } => self.notations.push(name),
            _ => {}
        }
        Ok(())
    }
}
