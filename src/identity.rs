//! Caller identity. The identity-provider handshake that produces these
//! values is an external collaborator; this crate treats
//! [`CallerIdentity`] as opaque input and never constructs one from a
//! credential itself.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A stable per-session identifier, used for cascade cancellation when
/// authentication is disabled and callers have no real identity to key on.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

/// The caller's identity and group claims, as produced by the (external)
/// identity provider. Absent when authentication is disabled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub subject: String,
    pub email: String,
    pub groups: HashSet<String>,
}

impl CallerIdentity {
    pub fn new(subject: impl Into<String>, email: impl Into<String>, groups: HashSet<String>) -> Self {
        Self {
            subject: subject.into(),
            email: email.into(),
            groups,
        }
    }

    pub fn is_in_any_group(&self, names: &[String]) -> bool {
        names.iter().any(|name| self.groups.contains(name))
    }
}

/// What the session/hub layers cascade-cancel against: either a real
/// identity's subject, or the per-session stable id when auth is disabled.
/// Keeping this distinct from `CallerIdentity` keeps cascade cancellation
/// precise even for anonymous clients.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Initiator {
    Identity(String),
    Anonymous(SessionId),
}

impl Initiator {
    pub fn for_caller(caller: Option<&CallerIdentity>, session: SessionId) -> Self {
        match caller {
            Some(identity) => Initiator::Identity(identity.subject.clone()),
            None => Initiator::Anonymous(session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_round_trips_through_display_and_parse() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn garbage_session_id_fails_to_parse() {
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
