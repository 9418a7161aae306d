//! Session names: the structured identifier behind every login.
//!
//! A [`SessionName`] answers three questions about a login:
//! - WHICH node issued it (optional, single-node deployments omit it)
//! - WHO logged in (the login name)
//! - WHICH of that user's concurrent sessions it is (the sequence)
//!
//! # Sequence numbers
//!
//! ```text
//!   sequence == 0   → the subject itself, no particular session
//!   sequence  < 0   → a session the server allocated (client named none)
//!   sequence  > 0   → a session the client asked for by number
//! ```
//!
//! # String forms
//!
//! ```text
//! relative    joe/7
//! qualified   client/joe/session/7
//! absolute    /node/heron/client/joe/session/7
//! ```
//!
//! Parsing also accepts the legacy flat layout `client/joe/7`. When a
//! name could be read either way, the `session` marker wins.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Shortest login name we accept.
pub const MIN_LOGIN_LEN: usize = 2;

/// The literal accepted in place of a login or sequence in patterns.
pub const WILDCARD: &str = "*";

const ROOT_MARKER: &str = "node";
const CLIENT_MARKER: &str = "client";
const SESSION_MARKER: &str = "session";

// ---------------------------------------------------------------------------
// Raw segment splitting (shared by names and patterns)
// ---------------------------------------------------------------------------

/// The three textual parts of a name before any validation.
struct RawParts<'a> {
    node: Option<&'a str>,
    login: &'a str,
    sequence: Option<&'a str>,
}

fn split_parts(raw: &str) -> Result<RawParts<'_>, ProtocolError> {
    let trimmed = raw.trim();

    let (node, relative) = match trimmed.strip_prefix('/') {
        Some(rest) => {
            let mut parts = rest.splitn(3, '/');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(ROOT_MARKER), Some(node), rest) if !node.is_empty() => {
                    (Some(node), rest.unwrap_or(""))
                }
                _ => return Err(ProtocolError::MalformedRoot(raw.to_string())),
            }
        }
        None => (None, trimmed),
    };

    let segments: Vec<&str> = relative.split('/').collect();
    if relative.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(ProtocolError::MissingRelative(raw.to_string()));
    }

    // A leading `client` marker is optional, but a bare `client` is a login.
    let body = if segments[0] == CLIENT_MARKER && segments.len() > 1 {
        &segments[1..]
    } else {
        &segments[..]
    };

    let (login, sequence) = match body {
        [login] => (*login, None),
        [login, SESSION_MARKER, seq] => (*login, Some(*seq)),
        [login, seq] => (*login, Some(*seq)),
        _ => return Err(ProtocolError::UnexpectedSegments(raw.to_string())),
    };

    Ok(RawParts {
        node,
        login,
        sequence,
    })
}

fn validate_login(login: &str) -> Result<(), ProtocolError> {
    if login.chars().count() < MIN_LOGIN_LEN
        || login.contains('/')
        || login == WILDCARD
    {
        return Err(ProtocolError::InvalidLogin(login.to_string()));
    }
    Ok(())
}

/// Checks that `node` can appear as the node segment of an absolute name.
pub fn validate_node(node: &str) -> Result<(), ProtocolError> {
    if node.trim().is_empty() || node.contains('/') {
        return Err(ProtocolError::InvalidNode(node.to_string()));
    }
    Ok(())
}

fn parse_sequence(raw: &str, segment: &str) -> Result<i64, ProtocolError> {
    segment.parse().map_err(|_| ProtocolError::InvalidSequence {
        name: raw.to_string(),
        segment: segment.to_string(),
    })
}

// ---------------------------------------------------------------------------
// SessionName
// ---------------------------------------------------------------------------

/// An immutable, node-qualified session identifier.
///
/// Serialized as its absolute string form, so it round-trips through
/// JSON as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionName {
    node: Option<String>,
    login: String,
    sequence: i64,
}

impl SessionName {
    /// Builds a name from its parts, validating the login.
    pub fn new(
        node: Option<&str>,
        login: &str,
        sequence: i64,
    ) -> Result<Self, ProtocolError> {
        validate_login(login)?;
        if let Some(node) = node {
            validate_node(node)?;
        }
        Ok(Self {
            node: node.map(str::to_string),
            login: login.to_string(),
            sequence,
        })
    }

    /// The subject-only name (`sequence == 0`) for a login.
    pub fn subject(node: Option<&str>, login: &str) -> Result<Self, ProtocolError> {
        Self::new(node, login, 0)
    }

    /// Parses any accepted string form.
    ///
    /// `default_node` fills in the node when the string is relative.
    pub fn parse(
        raw: &str,
        default_node: Option<&str>,
    ) -> Result<Self, ProtocolError> {
        let parts = split_parts(raw)?;
        validate_login(parts.login)?;
        let node = parts.node.or(default_node);
        if let Some(node) = node {
            validate_node(node)?;
        }
        let sequence = match parts.sequence {
            Some(segment) => parse_sequence(raw, segment)?,
            None => 0,
        };
        Ok(Self {
            node: node.map(str::to_string),
            login: parts.login.to_string(),
            sequence,
        })
    }

    /// Returns a copy carrying a different sequence.
    pub fn with_sequence(&self, sequence: i64) -> Self {
        Self {
            sequence,
            ..self.clone()
        }
    }

    /// Returns a copy bound to `node`, unless it already names one.
    pub fn with_default_node(&self, node: Option<&str>) -> Result<Self, ProtocolError> {
        match (&self.node, node) {
            (None, Some(node)) => {
                validate_node(node)?;
                Ok(Self {
                    node: Some(node.to_string()),
                    ..self.clone()
                })
            }
            _ => Ok(self.clone()),
        }
    }

    /// The node this name is qualified with, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The login name.
    pub fn login(&self) -> &str {
        &self.login
    }

    /// The session sequence (0 for the subject itself).
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// `true` if this names a session rather than just the subject.
    pub fn is_session(&self) -> bool {
        self.sequence != 0
    }

    /// `true` for server-allocated sessions (negative sequence).
    pub fn is_internal(&self) -> bool {
        self.sequence < 0
    }

    /// `true` for client-chosen sessions (positive sequence).
    pub fn is_public(&self) -> bool {
        self.sequence > 0
    }

    /// The subject-only form of this name.
    pub fn subject_name(&self) -> Self {
        self.with_sequence(0)
    }

    /// Compact relative form: `login[/sequence]`.
    pub fn relative_name(&self) -> String {
        if self.is_session() {
            format!("{}/{}", self.login, self.sequence)
        } else {
            self.login.clone()
        }
    }

    /// Qualified relative form: `client/login[/session/sequence]`.
    pub fn qualified_name(&self) -> String {
        if self.is_session() {
            format!(
                "{CLIENT_MARKER}/{}/{SESSION_MARKER}/{}",
                self.login, self.sequence
            )
        } else {
            format!("{CLIENT_MARKER}/{}", self.login)
        }
    }

    /// Absolute form: `/node/{node}/` + qualified form when the node is
    /// known, otherwise the qualified form alone.
    pub fn absolute_name(&self) -> String {
        match &self.node {
            Some(node) => format!("/{ROOT_MARKER}/{node}/{}", self.qualified_name()),
            None => self.qualified_name(),
        }
    }

    /// Returns `true` if this name is covered by `pattern`.
    pub fn matches(&self, pattern: &SessionPattern) -> bool {
        if let Some(node) = &pattern.node {
            if self.node.as_deref() != Some(node.as_str()) {
                return false;
            }
        }
        let login_ok = pattern
            .login
            .as_ref()
            .is_none_or(|login| *login == self.login);
        let sequence_ok = pattern
            .sequence
            .is_none_or(|sequence| sequence == self.sequence);
        login_ok && sequence_ok
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute_name())
    }
}

impl std::str::FromStr for SessionName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, None)
    }
}

impl TryFrom<String> for SessionName {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value, None)
    }
}

impl From<SessionName> for String {
    fn from(name: SessionName) -> Self {
        name.absolute_name()
    }
}

// ---------------------------------------------------------------------------
// SessionPattern
// ---------------------------------------------------------------------------

/// A session name in which one segment may be the wildcard `*`.
///
/// `joe/*` matches every session of `joe`, `*/3` matches sequence 3 of
/// any login. A pattern without a node matches names on any node. A
/// pattern without a sequence matches only subject names (sequence 0).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionPattern {
    node: Option<String>,
    /// `None` is the wildcard.
    login: Option<String>,
    /// `None` is the wildcard.
    sequence: Option<i64>,
}

impl SessionPattern {
    /// Parses a pattern. Accepts the same layouts as [`SessionName::parse`].
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let parts = split_parts(raw)?;

        let login = if parts.login == WILDCARD {
            None
        } else {
            validate_login(parts.login)?;
            Some(parts.login.to_string())
        };

        let sequence = match parts.sequence {
            Some(WILDCARD) => None,
            Some(segment) => Some(parse_sequence(raw, segment)?),
            None => Some(0),
        };

        if login.is_none() && sequence.is_none() {
            return Err(ProtocolError::TooManyWildcards(raw.to_string()));
        }

        Ok(Self {
            node: parts.node.map(str::to_string),
            login,
            sequence,
        })
    }

    /// A pattern matching exactly `name`.
    pub fn exact(name: &SessionName) -> Self {
        Self {
            node: name.node.clone(),
            login: Some(name.login.clone()),
            sequence: Some(name.sequence),
        }
    }

    /// A pattern matching every session of `login`.
    pub fn all_sessions_of(login: &str) -> Self {
        Self {
            node: None,
            login: Some(login.to_string()),
            sequence: None,
        }
    }
}

impl fmt::Display for SessionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "/{ROOT_MARKER}/{node}/")?;
        }
        let login = self.login.as_deref().unwrap_or(WILDCARD);
        match self.sequence {
            Some(0) => write!(f, "{CLIENT_MARKER}/{login}"),
            Some(seq) => write!(f, "{CLIENT_MARKER}/{login}/{SESSION_MARKER}/{seq}"),
            None => write!(f, "{CLIENT_MARKER}/{login}/{SESSION_MARKER}/{WILDCARD}"),
        }
    }
}
