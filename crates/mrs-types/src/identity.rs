use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The reserved identity used only in key-publication URLs, never as a
/// caller identity.
pub const RESERVED_SERVER_IDENTITY: &str = "_server";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    #[error("identity must be of the form user@domain")]
    NotUserAtDomain,
    #[error("user part {0:?} must match [A-Za-z0-9_.-]{{1,64}}")]
    InvalidUser(String),
    #[error("domain part {0:?} is not a valid host")]
    InvalidDomain(String),
    #[error("{RESERVED_SERVER_IDENTITY} may only appear in key URLs, not as a caller identity")]
    ReservedUser,
}

/// A parsed `user@domain` identity string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user: String,
    pub domain: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.domain)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        parse_identity(raw)
    }
}

fn valid_user_chars(user: &str) -> bool {
    !user.is_empty()
        && user.len() <= 64
        && user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn valid_domain(domain: &str) -> bool {
    !domain.is_empty() && url::Host::parse(domain).is_ok()
}

/// Parse `user@domain`, rejecting the reserved `_server` user as a caller
/// identity (it may only appear in key-publication URLs).
pub fn parse_identity(raw: &str) -> Result<Identity, IdentityError> {
    let (user, domain) = raw.split_once('@').ok_or(IdentityError::NotUserAtDomain)?;

    if user == RESERVED_SERVER_IDENTITY {
        return Err(IdentityError::ReservedUser);
    }
    if !valid_user_chars(user) {
        return Err(IdentityError::InvalidUser(user.to_string()));
    }
    if !valid_domain(domain) {
        return Err(IdentityError::InvalidDomain(domain.to_string()));
    }

    Ok(Identity {
        user: user.to_string(),
        domain: domain.to_string(),
    })
}

/// Like [parse_identity] but only validates, discarding the parse.
pub fn validate_identity(raw: &str) -> Result<(), IdentityError> {
    parse_identity(raw).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_identity() {
        let id = parse_identity("alice@a.example").unwrap();
        assert_eq!(id.user, "alice");
        assert_eq!(id.domain, "a.example");
    }

    #[test]
    fn rejects_missing_at() {
        assert_eq!(parse_identity("alice"), Err(IdentityError::NotUserAtDomain));
    }

    #[test]
    fn rejects_reserved_server_user() {
        assert_eq!(
            parse_identity("_server@a.example"),
            Err(IdentityError::ReservedUser)
        );
    }

    #[test]
    fn rejects_invalid_user_chars() {
        assert!(parse_identity("al ice@a.example").is_err());
    }
}
