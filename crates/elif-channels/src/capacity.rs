//! Per-channel queue limits

use crate::{CapacityMatcher, CapacityRule, ChannelError, ChannelResult};
use regex::Regex;
use wildmatch::WildMatch;

#[derive(Debug)]
enum CompiledMatcher {
    Exact(String),
    Glob(WildMatch),
    Regex(Regex),
}

impl CompiledMatcher {
    fn compile(matcher: &CapacityMatcher) -> ChannelResult<Self> {
        match matcher {
            CapacityMatcher::Exact(name) => Ok(CompiledMatcher::Exact(name.clone())),
            CapacityMatcher::Glob(pattern) => Ok(CompiledMatcher::Glob(WildMatch::new(pattern))),
            CapacityMatcher::Regex(pattern) => Regex::new(&format!("^(?:{})", pattern))
                .map(CompiledMatcher::Regex)
                .map_err(|e| {
                    ChannelError::Configuration(format!("Invalid capacity regex {:?}: {}", pattern, e))
                }),
        }
    }

    fn matches(&self, channel: &str) -> bool {
        match self {
            CompiledMatcher::Exact(name) => name == channel,
            CompiledMatcher::Glob(matcher) => matcher.matches(channel),
            CompiledMatcher::Regex(regex) => regex.is_match(channel),
        }
    }
}

/// Resolves the queue limit of a channel: first matching override, else the default
#[derive(Debug)]
pub struct CapacityPolicy {
    default: usize,
    overrides: Vec<(CompiledMatcher, usize)>,
}

impl CapacityPolicy {
    /// Compile `rules` in declared order
    pub fn new(default: usize, rules: &[CapacityRule]) -> ChannelResult<Self> {
        let overrides = rules
            .iter()
            .map(|rule| {
                if rule.capacity == 0 {
                    return Err(ChannelError::Configuration(format!(
                        "Capacity override {:?} must be at least 1",
                        rule.matcher
                    )));
                }
                Ok((CompiledMatcher::compile(&rule.matcher)?, rule.capacity))
            })
            .collect::<ChannelResult<Vec<_>>>()?;

        Ok(Self { default, overrides })
    }

    pub fn default_capacity(&self) -> usize {
        self.default
    }

    pub fn capacity_for(&self, channel: &str) -> usize {
        self.overrides
            .iter()
            .find(|(matcher, _)| matcher.matches(channel))
            .map(|(_, capacity)| *capacity)
            .unwrap_or(self.default)
    }
}
