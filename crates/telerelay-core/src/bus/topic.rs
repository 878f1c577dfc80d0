//! MQTT topic names and filters.

/// Whether `topic` is a valid filter: `#` only as the last level, wildcards only as whole levels.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(index, level)| match *level {
        "#" => index == last,
        "+" => true,
        other => !other.contains('#') && !other.contains('+'),
    })
}

/// Whether `topic` can be published to: non-empty and free of wildcards.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

/// Whether a concrete topic name matches a subscription filter.
pub fn matches(filter: &str, topic: &str) -> bool {
    // Wildcards never match topics starting with '$'
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
