// Shared helpers module
// URL joining and topic name tokenization used across probes
//
// Numan Thabit 2025 Nov

use anyhow::{bail, Result};

/// Joins two parts of a URL path with exactly one slash between them.
pub fn single_slash_join(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// First non-empty string among the candidates, or empty.
pub fn first_non_empty<'a>(values: &[&'a str]) -> &'a str {
    values
        .iter()
        .find(|v| !v.trim().is_empty())
        .copied()
        .unwrap_or("")
}

/// Parsed components of a fully qualified topic name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    pub is_persistent: bool,
    pub tenant: String,
    pub namespace: String,
    pub topic: String,
}

/// Tokenizes a topic full name into persistence flag, tenant, namespace,
/// and topic name.
pub fn tokenize_topic_full_name(topic_fn: &str) -> Result<TopicParts> {
    let (route, is_persistent) = if let Some(rest) = topic_fn.strip_prefix("persistent://") {
        (rest, true)
    } else if let Some(rest) = topic_fn.strip_prefix("non-persistent://") {
        (rest, false)
    } else {
        bail!("invalid persistent or non-persistent part in topic {topic_fn}");
    };

    let parts: Vec<&str> = route.split('/').collect();
    match parts.as_slice() {
        [tenant, namespace, topic] => Ok(TopicParts {
            is_persistent,
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            topic: topic.to_string(),
        }),
        [tenant, namespace] => Ok(TopicParts {
            is_persistent,
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            topic: String::new(),
        }),
        _ => bail!("missing tenant, namespace, or topic name in {topic_fn}"),
    }
}

/// Converts a fully qualified topic name to its admin URL route, e.g.
/// `persistent://t/ns/topic` becomes `persistent/t/ns/topic`.
pub fn topic_fn_to_url(topic_fn: &str) -> Result<String> {
    let parts: Vec<&str> = topic_fn.split("://").collect();
    if parts.len() != 2 {
        bail!("invalid topic full name pattern {topic_fn}");
    }
    if parts[1].split('/').count() != 3 {
        bail!("missing tenant or namespace or topic in {topic_fn}");
    }
    Ok(topic_fn.replacen("://", "/", 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_join_dedupes() {
        assert_eq!(single_slash_join("http://a.com", "b"), "http://a.com/b");
        assert_eq!(single_slash_join("http://a.com/", "/b"), "http://a.com/b");
        assert_eq!(single_slash_join("http://a.com/", "b"), "http://a.com/b");
        assert_eq!(single_slash_join("http://a.com", "/b"), "http://a.com/b");
    }

    #[test]
    fn first_non_empty_picks_in_order() {
        assert_eq!(first_non_empty(&["", "  ", "second", "third"]), "second");
        assert_eq!(first_non_empty(&["", ""]), "");
    }

    #[test]
    fn tokenize_full_name() {
        let parts = tokenize_topic_full_name("persistent://mytenant/local/test-topic").unwrap();
        assert!(parts.is_persistent);
        assert_eq!(parts.tenant, "mytenant");
        assert_eq!(parts.namespace, "local");
        assert_eq!(parts.topic, "test-topic");

        let parts = tokenize_topic_full_name("non-persistent://t/ns").unwrap();
        assert!(!parts.is_persistent);
        assert_eq!(parts.topic, "");

        assert!(tokenize_topic_full_name("t/ns/topic").is_err());
        assert!(tokenize_topic_full_name("persistent://t/ns/a/b").is_err());
    }

    #[test]
    fn topic_fn_to_url_route() {
        assert_eq!(
            topic_fn_to_url("persistent://t/ns/topic").unwrap(),
            "persistent/t/ns/topic"
        );
        assert!(topic_fn_to_url("persistent://t/ns").is_err());
        assert!(topic_fn_to_url("no-scheme").is_err());
    }
}
