use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// User lifecycle topics, named `<entity>-<action>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    UserCreate,
    UserUpdate,
    UserRemove,
}

/// What a delivery on a topic asks the worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicAction {
    /// Fetch or decode the user and reconcile it into the live collection
    Sync,
    /// Archive the live record, then delete it
    Remove,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::UserCreate, Topic::UserUpdate, Topic::UserRemove];

    pub fn name(&self) -> &'static str {
        match self {
            Topic::UserCreate => "user-create",
            Topic::UserUpdate => "user-update",
            Topic::UserRemove => "user-remove",
        }
    }

    pub fn action(&self) -> TopicAction {
        match self {
            Topic::UserCreate | Topic::UserUpdate => TopicAction::Sync,
            Topic::UserRemove => TopicAction::Remove,
        }
    }

    /// Broker subject, e.g. `VirtualTopic.user-create`
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}.{}", prefix, self.name())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("unknown topic: {0}")]
    Unknown(String),

    #[error("no topics configured")]
    Empty,
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.name() == s)
            .ok_or_else(|| TopicError::Unknown(s.to_string()))
    }
}

/// The topics this worker subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet(BTreeSet<Topic>);

impl TopicSet {
    pub fn all() -> Self {
        Self(Topic::ALL.into_iter().collect())
    }

    /// Parse a comma-separated list such as `user-create,user-remove`
    pub fn parse(list: &str) -> Result<Self, TopicError> {
        let topics = list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(Topic::from_str)
            .collect::<Result<BTreeSet<_>, _>>()?;

        if topics.is_empty() {
            return Err(TopicError::Empty);
        }
        Ok(Self(topics))
    }

    pub fn iter(&self) -> impl Iterator<Item = Topic> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, topic: Topic) -> bool {
        self.0.contains(&topic)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for TopicSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for TopicSet {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_follows_convention() {
        assert_eq!(
            Topic::UserCreate.subject("VirtualTopic"),
            "VirtualTopic.user-create"
        );
        assert_eq!(
            Topic::UserRemove.subject("VirtualTopic"),
            "VirtualTopic.user-remove"
        );
    }

    #[test]
    fn test_actions() {
        assert_eq!(Topic::UserCreate.action(), TopicAction::Sync);
        assert_eq!(Topic::UserUpdate.action(), TopicAction::Sync);
        assert_eq!(Topic::UserRemove.action(), TopicAction::Remove);
    }

    #[test]
    fn test_parse_topic_set() {
        let topics = TopicSet::parse(" user-remove, user-create ,").unwrap();

        assert_eq!(topics.len(), 2);
        assert!(topics.contains(Topic::UserCreate));
        assert!(topics.contains(Topic::UserRemove));
        assert!(!topics.contains(Topic::UserUpdate));
    }

    #[test]
    fn test_parse_deduplicates() {
        let topics = TopicSet::parse("user-update,user-update").unwrap();
        assert_eq!(topics.iter().collect::<Vec<_>>(), vec![Topic::UserUpdate]);
    }

    #[test]
    fn test_parse_rejects_unknown_and_empty() {
        assert_eq!(
            TopicSet::parse("user-create,user-delete"),
            Err(TopicError::Unknown("user-delete".to_string()))
        );
        assert_eq!(TopicSet::parse(" , "), Err(TopicError::Empty));
    }

    #[test]
    fn test_default_is_all_topics() {
        assert_eq!(TopicSet::default().len(), 3);
    }
}
