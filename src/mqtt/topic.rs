//! Topic name and topic filter grammar.

const SHARED_PREFIX: &str = "$share/";

/// A topic name carries no wildcards and is not empty.
pub fn is_valid_name(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

/// Validate a subscription filter: `#` only as the last whole level, `+`
/// only as a whole level, and shared filters naming a group and a filter.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let filter = match filter.strip_prefix(SHARED_PREFIX) {
        Some(rest) => match rest.split_once('/') {
            Some((group, inner)) if !group.is_empty() && !group.contains(['+', '#']) => inner,
            _ => return false,
        },
        None => filter,
    };
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(index, level)| match *level {
        "#" => index == last,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}

pub fn is_shared(filter: &str) -> bool {
    filter.starts_with(SHARED_PREFIX)
}

pub fn has_wildcard(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

/// Whether `topic` matches `filter`. Topics starting with `$` are not
/// matched by a leading wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_grammar() {
        assert!(is_valid_filter("a/b"));
        assert!(is_valid_filter("a/+/c"));
        assert!(is_valid_filter("#"));
        assert!(is_valid_filter("a/#"));
        assert!(is_valid_filter("$share/group/a/+"));
        assert!(!is_valid_filter(""));
        assert!(!is_valid_filter("a/#/c"));
        assert!(!is_valid_filter("a/b#"));
        assert!(!is_valid_filter("a+/b"));
        assert!(!is_valid_filter("$share/group"));
        assert!(!is_valid_filter("$share//a"));
    }

    #[test]
    fn names_reject_wildcards() {
        assert!(is_valid_name("a/b"));
        assert!(!is_valid_name("a/+"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn matching_follows_levels() {
        assert!(matches("a/b", "a/b"));
        assert!(matches("a/+", "a/b"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("#", "x/y"));
        assert!(!matches("#", "$SYS/sessions/c"));
        assert!(matches("$SYS/#", "$SYS/sessions/c"));
        assert!(!matches("a/b", "a/c"));
    }

    #[test]
    fn shared_and_wildcard_detection() {
        assert!(is_shared("$share/g/a"));
        assert!(!is_shared("a/$share"));
        assert!(has_wildcard("a/+"));
        assert!(!has_wildcard("a/b"));
    }
}
