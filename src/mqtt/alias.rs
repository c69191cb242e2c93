//! Inbound topic alias table for one MQTT connection.

use std::collections::HashMap;

use thiserror::Error;

use super::reason::{ReasonCode, ReasonCodes};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicAliasError {
    #[error("topic alias cannot be zero")]
    ZeroAlias,
    #[error("topic alias {alias} exceeds maximum {max}")]
    AliasExceedsMax { alias: u16, max: u16 },
    #[error("topic alias {0} has not been registered")]
    UnknownAlias(u16),
    #[error("empty topic provided without topic alias")]
    EmptyTopicNoAlias,
}

impl TopicAliasError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            TopicAliasError::ZeroAlias | TopicAliasError::AliasExceedsMax { .. } => {
                ReasonCodes::TOPIC_ALIAS_INVALID
            }
            TopicAliasError::UnknownAlias(_) | TopicAliasError::EmptyTopicNoAlias => {
                ReasonCodes::PROTOCOL_ERROR
            }
        }
    }
}

/// Alias to topic mappings established by the client, cleared per connection.
#[derive(Debug, Clone, Default)]
pub struct TopicAliases {
    aliases: HashMap<u16, String>,
    max_alias: u16,
}

impl TopicAliases {
    pub fn new(max_alias: u16) -> Self {
        Self {
            aliases: HashMap::new(),
            max_alias,
        }
    }

    /// Change the negotiated maximum, forgetting aliases above it.
    pub fn set_max_alias(&mut self, max: u16) {
        self.max_alias = max;
        self.aliases.retain(|&alias, _| alias <= max);
    }

    pub fn max_alias(&self) -> u16 {
        self.max_alias
    }

    pub fn get(&self, alias: u16) -> Option<&str> {
        self.aliases.get(&alias).map(String::as_str)
    }

    /// Resolve the topic of a PUBLISH.
    ///
    /// A topic with an alias establishes or overwrites the mapping, an empty
    /// topic with an alias looks it up, and an empty topic without one is a
    /// protocol error.
    pub fn resolve(&mut self, topic: &str, alias: Option<u16>) -> Result<String, TopicAliasError> {
        match alias {
            Some(0) => Err(TopicAliasError::ZeroAlias),
            Some(alias) if alias > self.max_alias => Err(TopicAliasError::AliasExceedsMax {
                alias,
                max: self.max_alias,
            }),
            Some(alias) if topic.is_empty() => self
                .get(alias)
                .map(str::to_string)
                .ok_or(TopicAliasError::UnknownAlias(alias)),
            Some(alias) => {
                self.aliases.insert(alias, topic.to_string());
                Ok(topic.to_string())
            }
            None if topic.is_empty() => Err(TopicAliasError::EmptyTopicNoAlias),
            None => Ok(topic.to_string()),
        }
    }

    pub fn clear(&mut self) {
        self.aliases.clear();
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_round_trip() {
        let mut aliases = TopicAliases::new(10);
        assert_eq!(aliases.resolve("topic/x", Some(1)).unwrap(), "topic/x");
        assert_eq!(aliases.resolve("", Some(1)).unwrap(), "topic/x");
    }

    #[test]
    fn unknown_alias_is_protocol_error() {
        let mut aliases = TopicAliases::new(10);
        let err = aliases.resolve("", Some(5)).unwrap_err();
        assert_eq!(err, TopicAliasError::UnknownAlias(5));
        assert_eq!(err.reason(), ReasonCodes::PROTOCOL_ERROR);
    }

    #[test]
    fn new_topic_overwrites_alias() {
        let mut aliases = TopicAliases::new(10);
        aliases.resolve("topic/x", Some(1)).unwrap();
        aliases.resolve("topic/y", Some(1)).unwrap();
        assert_eq!(aliases.get(1), Some("topic/y"));
        assert_eq!(aliases.len(), 1);
    }

    #[test]
    fn alias_bounds() {
        let mut aliases = TopicAliases::new(5);
        assert_eq!(aliases.resolve("t", Some(0)), Err(TopicAliasError::ZeroAlias));
        let err = aliases.resolve("t", Some(6)).unwrap_err();
        assert_eq!(err, TopicAliasError::AliasExceedsMax { alias: 6, max: 5 });
        assert_eq!(err.reason(), ReasonCodes::TOPIC_ALIAS_INVALID);
        assert_eq!(aliases.resolve("", None), Err(TopicAliasError::EmptyTopicNoAlias));
        assert_eq!(aliases.resolve("t", None).unwrap(), "t");
        assert!(aliases.is_empty());
    }

    #[test]
    fn lowering_max_forgets_higher_aliases() {
        let mut aliases = TopicAliases::new(10);
        aliases.resolve("a", Some(2)).unwrap();
        aliases.resolve("b", Some(8)).unwrap();
        aliases.set_max_alias(4);
        assert_eq!(aliases.max_alias(), 4);
        assert_eq!(aliases.get(8), None);
        aliases.clear();
        assert!(aliases.is_empty());
    }
}
