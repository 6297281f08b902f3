//! Channel key ↔ backplane topic naming.

/// Matched injective pair mapping channel keys to backplane topics.
///
/// Implementations must guarantee `key_from_full_key(full_key(k)) == Some(k)`
/// for every valid `k`, including keys that contain the scheme's own
/// delimiter characters.
pub trait TopicScheme: Send + Sync + 'static {
    /// The topic published/subscribed on the backplane for `key`.
    fn full_key(&self, key: &str) -> String;

    /// Decodes a backplane topic back to its channel key. `None` means the
    /// topic does not belong to this scheme, which callers treat as a
    /// configuration defect.
    fn key_from_full_key(&self, topic: &str) -> Option<String>;
}

/// Default scheme: `"{prefix}:{key}"`.
///
/// Decoding strips only the leading prefix, so keys may freely contain the
/// `:` delimiter themselves.
#[derive(Debug, Clone)]
pub struct PrefixTopics {
    prefix: String,
}

impl PrefixTopics {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with(':') {
            prefix.push(':');
        }
        Self { prefix }
    }
}

impl TopicScheme for PrefixTopics {
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn key_from_full_key(&self, topic: &str) -> Option<String> {
        topic.strip_prefix(&self.prefix).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_keys() {
        let topics = PrefixTopics::new("relay:channels");
        let topic = topics.full_key("orders");
        assert_eq!(topic, "relay:channels:orders");
        assert_eq!(topics.key_from_full_key(&topic).as_deref(), Some("orders"));
    }

    #[test]
    fn round_trips_keys_containing_the_delimiter() {
        let topics = PrefixTopics::new("relay:channels");
        for key in ["a:b", ":", "room:1:2:3", "relay:channels:x", ""] {
            let topic = topics.full_key(key);
            assert_eq!(
                topics.key_from_full_key(&topic).as_deref(),
                Some(key),
                "key {key:?} must survive the round trip"
            );
        }
    }

    #[test]
    fn rejects_topics_from_another_scheme() {
        let topics = PrefixTopics::new("relay:channels");
        assert_eq!(topics.key_from_full_key("other:prefix:orders"), None);
    }
}
