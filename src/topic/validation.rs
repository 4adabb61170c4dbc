//! Topic name and filter validation
//!
//! Rules applied before anything reaches the store or the broker:
//! - Topic names (publish) MUST NOT contain wildcards (+ or #)
//! - Topic filters (subscriptions) MAY contain wildcards
//! - Multi-level wildcard (#) must occupy the last level
//! - Single-level wildcard (+) must occupy an entire level
//! - Both are limited to `MAX_TOPIC_CHARS` characters, matching the width of
//!   the persisted topic columns

/// Maximum length of a topic name or topic filter, in characters
pub const MAX_TOPIC_CHARS: usize = 500;

/// Maximum length of a subscription description, in characters
pub const MAX_DESCRIPTION_CHARS: usize = 255;

fn check_common(value: &str, what: &'static str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} cannot be empty", what));
    }

    let chars = value.chars().count();
    if chars > MAX_TOPIC_CHARS {
        return Err(format!(
            "{} exceeds maximum length ({} > {} characters)",
            what, chars, MAX_TOPIC_CHARS
        ));
    }

    if value.contains('\0') {
        return Err(format!("{} cannot contain null character", what));
    }

    Ok(())
}

/// Validate a topic name (used for outbound publish)
pub fn validate_topic_name(topic: &str) -> Result<(), String> {
    check_common(topic, "topic name")?;

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards".to_string());
    }

    Ok(())
}

/// Validate a topic filter (used for subscriptions)
///
/// Shared subscriptions (`$share/{group}/{filter}`) are accepted; the group
/// must be non-empty and wildcard-free and the inner filter follows the
/// normal rules.
pub fn validate_topic_filter(filter: &str) -> Result<(), String> {
    check_common(filter, "topic filter")?;

    let actual_filter = if let Some(rest) = filter.strip_prefix("$share/") {
        let Some((group, actual)) = rest.split_once('/') else {
            return Err("invalid shared subscription format".to_string());
        };
        if group.is_empty() {
            return Err("shared subscription group name cannot be empty".to_string());
        }
        if group.contains('+') || group.contains('#') {
            return Err("shared subscription group name cannot contain wildcards".to_string());
        }
        if actual.is_empty() {
            return Err("shared subscription filter cannot be empty".to_string());
        }
        actual
    } else {
        filter
    };

    let levels: Vec<&str> = actual_filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level".to_string());
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level".to_string());
            }
        }

        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy entire level".to_string());
        }
    }

    Ok(())
}

/// Validate an optional subscription description
pub fn validate_description(description: Option<&str>) -> Result<(), String> {
    match description {
        Some(text) if text.chars().count() > MAX_DESCRIPTION_CHARS => Err(format!(
            "description exceeds maximum length ({} characters)",
            MAX_DESCRIPTION_CHARS
        )),
        _ => Ok(()),
    }
}
