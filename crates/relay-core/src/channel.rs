//! Channel naming and subscription patterns.
//!
//! Backend channels are named `<namespace>:<class>:<suffix>`:
//!
//! | Class | Tag | Suffix | Dispatched |
//! |-------|-----|--------|------------|
//! | [`ChannelClass::Direct`] | `d` | event type | yes |
//! | [`ChannelClass::Control`] | `c` | `health:<origin>` | no |
//!
//! Direct channel derivation is a pure, reversible function of the event
//! type, so the subscriber side recovers the type from the channel alone.

use std::fmt;

use crate::error::{Error, Result};

/// Longest accepted event type.
pub const MAX_EVENT_TYPE_LEN: usize = 512;

const GLOB_CHARS: [char; 5] = ['*', '?', '[', ']', '\\'];

/// Channel class, the single-letter segment after the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelClass {
    /// Broadcast event traffic, delivered to local subscribers.
    Direct,
    /// Bus-internal traffic (health heartbeats).
    Control,
}

impl ChannelClass {
    /// The one-letter tag used in channel names.
    pub fn tag(&self) -> char {
        match self {
            ChannelClass::Direct => 'd',
            ChannelClass::Control => 'c',
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "d" => Some(ChannelClass::Direct),
            "c" => Some(ChannelClass::Control),
            _ => None,
        }
    }
}

/// Validate an event type for publishing.
///
/// Types are dot- or colon-delimited hierarchical names. They may not be
/// empty, contain whitespace or control characters, or contain backend glob
/// metacharacters (which would make channel subscriptions ambiguous).
pub fn validate_event_type(event_type: &str) -> Result<()> {
    if event_type.is_empty() {
        return Err(Error::InvalidInput("event type must not be empty".into()));
    }
    if event_type.len() > MAX_EVENT_TYPE_LEN {
        return Err(Error::InvalidInput(format!(
            "event type exceeds {} bytes",
            MAX_EVENT_TYPE_LEN
        )));
    }
    if let Some(c) = event_type
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || GLOB_CHARS.contains(c))
    {
        return Err(Error::InvalidInput(format!(
            "event type {:?} contains forbidden character {:?}",
            event_type, c
        )));
    }
    Ok(())
}

/// A local subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pattern {
    /// Matches one event type exactly.
    Exact(String),
    /// Matches every type starting with the prefix (`"workspace:*"`).
    Prefix(String),
    /// Matches every event type (`"*"`).
    All,
}

impl Pattern {
    /// Parse a pattern string.
    ///
    /// A `*` is only valid as the final character.
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern == "*" {
            return Ok(Pattern::All);
        }
        match pattern.strip_suffix('*') {
            Some(prefix) => {
                validate_event_type(prefix).map_err(|e| {
                    Error::InvalidInput(format!("invalid pattern {:?}: {}", pattern, e))
                })?;
                Ok(Pattern::Prefix(prefix.to_string()))
            }
            None => {
                validate_event_type(pattern).map_err(|e| {
                    Error::InvalidInput(format!("invalid pattern {:?}: {}", pattern, e))
                })?;
                Ok(Pattern::Exact(pattern.to_string()))
            }
        }
    }

    /// Whether this pattern matches an event type.
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Pattern::Exact(t) => t == event_type,
            Pattern::Prefix(p) => event_type.starts_with(p.as_str()),
            Pattern::All => true,
        }
    }

    /// Whether this pattern needs a backend pattern subscription.
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, Pattern::Exact(_))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Exact(t) => write!(f, "{}", t),
            Pattern::Prefix(p) => write!(f, "{}*", p),
            Pattern::All => write!(f, "*"),
        }
    }
}

/// A backend-level subscription: `SUBSCRIBE` for exact channels, `PSUBSCRIBE`
/// for glob patterns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendChannel {
    Channel(String),
    Pattern(String),
}

impl BackendChannel {
    /// The channel or glob string sent to the backend.
    pub fn name(&self) -> &str {
        match self {
            BackendChannel::Channel(c) | BackendChannel::Pattern(c) => c,
        }
    }
}

impl fmt::Display for BackendChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendChannel::Channel(c) => write!(f, "channel:{}", c),
            BackendChannel::Pattern(p) => write!(f, "pattern:{}", p),
        }
    }
}

/// Derives and parses channel names under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNamer {
    namespace: String,
}

impl ChannelNamer {
    /// Create a namer for the given namespace prefix.
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(Error::Config("namespace prefix must not be empty".into()));
        }
        if namespace
            .chars()
            .any(|c| c.is_whitespace() || GLOB_CHARS.contains(&c))
        {
            return Err(Error::Config(format!(
                "namespace prefix {:?} contains whitespace or glob characters",
                namespace
            )));
        }
        Ok(Self { namespace })
    }

    /// The namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn class_prefix(&self, class: ChannelClass) -> String {
        format!("{}:{}:", self.namespace, class.tag())
    }

    /// Direct channel for an event type.
    pub fn direct(&self, event_type: &str) -> String {
        format!("{}{}", self.class_prefix(ChannelClass::Direct), event_type)
    }

    /// Control channel carrying one process's health heartbeats.
    pub fn health(&self, origin: &str) -> String {
        format!(
            "{}{}",
            self.class_prefix(ChannelClass::Control),
            Self::heartbeat_type(origin)
        )
    }

    /// Event type carried by heartbeats on the control channel.
    pub fn heartbeat_type(origin: &str) -> String {
        format!("health:{}", origin)
    }

    /// Split a channel into its class and suffix.
    pub fn parse<'a>(&self, channel: &'a str) -> Result<(ChannelClass, &'a str)> {
        let rest = channel
            .strip_prefix(self.namespace.as_str())
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| {
                Error::Decode(format!(
                    "channel {:?} is outside namespace {:?}",
                    channel, self.namespace
                ))
            })?;
        let (tag, suffix) = rest
            .split_once(':')
            .ok_or_else(|| Error::Decode(format!("channel {:?} has no class segment", channel)))?;
        let class = ChannelClass::from_tag(tag)
            .ok_or_else(|| Error::Decode(format!("unknown channel class {:?}", tag)))?;
        if suffix.is_empty() {
            return Err(Error::Decode(format!("channel {:?} has an empty suffix", channel)));
        }
        Ok((class, suffix))
    }

    /// Recover the event type from a direct channel.
    pub fn parse_direct<'a>(&self, channel: &'a str) -> Result<&'a str> {
        match self.parse(channel)? {
            (ChannelClass::Direct, event_type) => Ok(event_type),
            (class, _) => Err(Error::Decode(format!(
                "channel {:?} is a {:?} channel, not direct",
                channel, class
            ))),
        }
    }

    /// Backend subscription serving a local pattern.
    pub fn backend_channel(&self, pattern: &Pattern) -> BackendChannel {
        let prefix = self.class_prefix(ChannelClass::Direct);
        match pattern {
            Pattern::Exact(t) => BackendChannel::Channel(format!("{}{}", prefix, t)),
            Pattern::Prefix(p) => BackendChannel::Pattern(format!("{}{}*", prefix, p)),
            Pattern::All => BackendChannel::Pattern(format!("{}*", prefix)),
        }
    }
}
