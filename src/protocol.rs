//! Protocol allow-list checks
//!
//! External DTDs, entities and schemas are only fetched when the scheme of
//! their system identifier appears in a comma-separated allow-list, or when
//! the allow-list is the wildcard.

use url::Url;

use crate::error::{Error, Result};

/// A parsed allow-list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolAllowList {
    /// Any protocol is permitted
    Any,
    /// Only these protocols, lowercased and trimmed
    Only(Vec<String>),
}

impl ProtocolAllowList {
    /// Parse an allow-list; an absent list permits nothing
    pub fn parse(allowed: Option<&str>, wildcard: &str) -> Self {
        match allowed {
            Some(list) if list.eq_ignore_ascii_case(wildcard) => ProtocolAllowList::Any,
            Some(list) => ProtocolAllowList::Only(
                list.split(',')
                    .map(|token| token.trim().to_ascii_lowercase())
                    .collect(),
            ),
            None => ProtocolAllowList::Only(Vec::new()),
        }
    }

    /// Whether a protocol is permitted
    pub fn permits(&self, protocol: &str) -> bool {
        match self {
            ProtocolAllowList::Any => true,
            ProtocolAllowList::Only(tokens) => {
                tokens.iter().any(|t| t.eq_ignore_ascii_case(protocol))
            }
        }
    }
}

/// Derive the protocol of a system identifier
///
/// Identifiers without a `:` are relative file paths. A `jar:` URL embeds
/// another URL, whose scheme is used instead.
pub fn protocol_of(system_id: &str) -> Result<String> {
    if !system_id.contains(':') {
        return Ok("file".to_string());
    }

    let url = Url::parse(system_id)?;
    if url.scheme().eq_ignore_ascii_case("jar") {
        let path = url.path();
        return match path.find(':') {
            Some(end) => Ok(path[..end].to_ascii_lowercase()),
            None => Err(Error::InvalidUri(format!(
                "jar URL without an inner scheme: {}",
                system_id
            ))),
        };
    }
    Ok(url.scheme().to_string())
}

/// Check a system identifier against an allow-list
///
/// Returns `Ok(None)` when access is permitted and `Ok(Some(protocol))`
/// naming the rejected protocol otherwise. An identifier that cannot be
/// parsed is an error for the caller to handle.
pub fn check_access(
    system_id: Option<&str>,
    allowed: Option<&str>,
    wildcard: &str,
) -> Result<Option<String>> {
    let system_id = match system_id {
        Some(id) => id,
        None => return Ok(None),
    };

    let allow_list = ProtocolAllowList::parse(allowed, wildcard);
    if allow_list == ProtocolAllowList::Any {
        return Ok(None);
    }

    let protocol = protocol_of(system_id)?;
    if allow_list.permits(&protocol) {
        Ok(None)
    } else {
        Ok(Some(protocol))
    }
}
