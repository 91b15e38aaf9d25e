//! Channel and group name rules
//!
//! Channel names are at most [`MAX_NAME_LENGTH`] characters of ASCII letters,
//! digits, `.`, `-` and `_`, with at most one `!`. A name containing `!` is
//! process-local: `PREFIX!TOKEN.SUFFIX`, where `TOKEN` is the identity of the
//! layer instance that minted it. Only that instance may receive on it.

use crate::{ChannelError, ChannelResult};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use uuid::Uuid;

/// Longest accepted channel or group name
pub const MAX_NAME_LENGTH: usize = 100;

/// Separator between the public prefix and the owner part of a process-local name
pub const LOCAL_SEPARATOR: char = '!';

const RANDOM_SUFFIX_LENGTH: usize = 12;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

/// A syntactically valid channel name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelName<'a> {
    raw: &'a str,
    separator: Option<usize>,
}

impl<'a> ChannelName<'a> {
    /// Validate `name` and split it into its parts
    pub fn parse(name: &'a str) -> ChannelResult<Self> {
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return Err(ChannelError::InvalidChannelName(format!(
                "{:?} must be 1 to {} characters long",
                name, MAX_NAME_LENGTH
            )));
        }

        let mut separator = None;
        for (index, c) in name.char_indices() {
            if c == LOCAL_SEPARATOR {
                if separator.is_some() {
                    return Err(ChannelError::InvalidChannelName(format!(
                        "{:?} contains more than one '{}'",
                        name, LOCAL_SEPARATOR
                    )));
                }
                separator = Some(index);
            } else if !is_name_char(c) {
                return Err(ChannelError::InvalidChannelName(format!(
                    "{:?} contains invalid character {:?}",
                    name, c
                )));
            }
        }

        if separator == Some(0) {
            return Err(ChannelError::InvalidChannelName(format!(
                "{:?} has an empty prefix",
                name
            )));
        }

        Ok(Self {
            raw: name,
            separator,
        })
    }

    pub fn as_str(&self) -> &'a str {
        self.raw
    }

    pub fn is_process_local(&self) -> bool {
        self.separator.is_some()
    }

    /// Token naming the owning instance, for process-local names
    pub fn owner_token(&self) -> Option<&'a str> {
        self.separator.map(|index| {
            let local = &self.raw[index + 1..];
            local.split('.').next().unwrap_or(local)
        })
    }

    /// Name of the store queue holding this channel's messages.
    ///
    /// Public channels have a queue of their own. Process-local channels share
    /// one queue per `PREFIX!TOKEN`, which is also what they are sharded by.
    pub fn queue_name(&self) -> &'a str {
        match (self.separator, self.owner_token()) {
            (Some(index), Some(token)) => &self.raw[..index + 1 + token.len()],
            _ => self.raw,
        }
    }
}

impl fmt::Display for ChannelName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw)
    }
}

/// Validate a channel name for sending or group membership
pub fn validate(name: &str) -> ChannelResult<ChannelName<'_>> {
    ChannelName::parse(name)
}

/// Validate a group name: no `!` allowed, shorter than [`MAX_NAME_LENGTH`]
pub fn validate_group(name: &str) -> ChannelResult<&str> {
    if name.is_empty() || name.len() >= MAX_NAME_LENGTH || !name.chars().all(is_name_char) {
        return Err(ChannelError::InvalidGroupName(name.to_string()));
    }
    Ok(name)
}

/// Random identity of one channel layer instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate `name` for receiving: process-local names must carry this identity
    pub fn validate_receive<'a>(&self, name: &'a str) -> ChannelResult<ChannelName<'a>> {
        let parsed = ChannelName::parse(name)?;
        match parsed.owner_token() {
            Some(token) if token != self.0 => {
                Err(ChannelError::OwnershipViolation(name.to_string()))
            }
            _ => Ok(parsed),
        }
    }

    /// Mint a fresh process-local name `prefix!identity.random`
    pub fn mint(&self, prefix: &str) -> ChannelResult<String> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_SUFFIX_LENGTH)
            .map(char::from)
            .collect();
        let name = format!("{}{}{}.{}", prefix, LOCAL_SEPARATOR, self.0, suffix);
        // A '!' in the prefix makes a second separator and fails here.
        ChannelName::parse(&name)?;
        Ok(name)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_public_names() {
        for name in ["test-channel-1", "a", "http.request", "under_score.v2"] {
            let parsed = validate(name).unwrap();
            assert!(!parsed.is_process_local());
            assert_eq!(parsed.queue_name(), name);
            assert_eq!(parsed.owner_token(), None);
        }
    }

    #[test]
    fn test_invalid_names() {
        let too_long = "a".repeat(MAX_NAME_LENGTH + 1);
        for name in ["", "=+135!", "two!bangs!", "sp ace", "!nothing", "tab\t", too_long.as_str()] {
            assert!(
                matches!(validate(name), Err(ChannelError::InvalidChannelName(_))),
                "{:?} should be rejected",
                name
            );
        }
        assert!(validate(&"a".repeat(MAX_NAME_LENGTH)).is_ok());
    }

    #[test]
    fn test_process_local_parts() {
        let parsed = validate("specific!abc123.XyZ").unwrap();
        assert!(parsed.is_process_local());
        assert_eq!(parsed.owner_token(), Some("abc123"));
        assert_eq!(parsed.queue_name(), "specific!abc123");

        let parsed = validate("specific!local_part").unwrap();
        assert_eq!(parsed.owner_token(), Some("local_part"));
        assert_eq!(parsed.queue_name(), "specific!local_part");

        let parsed = validate("specific!").unwrap();
        assert_eq!(parsed.owner_token(), Some(""));
        assert_eq!(parsed.queue_name(), "specific!");
    }

    #[test]
    fn test_group_names() {
        assert!(validate_group("test-group").is_ok());
        assert!(validate_group("chat.room_1").is_ok());
        assert!(matches!(
            validate_group("bad!group"),
            Err(ChannelError::InvalidGroupName(_))
        ));
        assert!(validate_group("").is_err());
        assert!(validate_group(&"g".repeat(MAX_NAME_LENGTH)).is_err());
    }

    #[test]
    fn test_minted_names_are_owned() {
        let identity = ClientIdentity::generate();
        let name = identity.mint("specific").unwrap();
        assert!(name.starts_with("specific!"));

        let parsed = identity.validate_receive(&name).unwrap();
        assert_eq!(parsed.owner_token(), Some(identity.as_str()));
        assert_eq!(
            parsed.queue_name(),
            format!("specific!{}", identity.as_str())
        );
    }

    #[test]
    fn test_foreign_names_are_rejected() {
        let identity = ClientIdentity::generate();
        let other = ClientIdentity::generate();
        let name = other.mint("specific").unwrap();

        assert!(matches!(
            identity.validate_receive(&name),
            Err(ChannelError::OwnershipViolation(_))
        ));
        assert!(matches!(
            identity.validate_receive("not-client-prefix!local_part"),
            Err(ChannelError::OwnershipViolation(_))
        ));
        // Public names have no owner.
        assert!(identity.validate_receive("test-channel-1").is_ok());
    }

    #[test]
    fn test_mint_rejects_bad_prefix() {
        let identity = ClientIdentity::generate();
        assert!(identity.mint("has!bang").is_err());
        assert!(identity.mint("sp ace").is_err());
        assert!(identity.mint(&"p".repeat(80)).is_err());
    }

    #[test]
    fn test_minted_names_do_not_collide() {
        let identity = ClientIdentity::generate();
        let names: HashSet<String> = (0..5000)
            .map(|_| identity.mint("specific").unwrap())
            .collect();
        assert_eq!(names.len(), 5000);
    }
}
