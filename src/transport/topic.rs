//! MQTT topic filter validation and wildcard matching (MQTT v5 section 4.7)

use crate::error::TransportError;

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";
const SHARED_PREFIX: &str = "$share/";

/// Split `$share/{group}/{filter}` into its group and filter.
fn split_shared(filter: &str) -> Option<(&str, &str)> {
    filter.strip_prefix(SHARED_PREFIX)?.split_once(LEVEL_SEPARATOR)
}

/// The part of a filter that is matched against topic names
fn matching_part(filter: &str) -> &str {
    split_shared(filter).map_or(filter, |(_, filter)| filter)
}

/// Check a topic filter against the MQTT wildcard rules.
pub fn validate_topic_filter(filter: &str) -> Result<(), TransportError> {
    let invalid = |reason: &str| -> Result<(), TransportError> {
        Err(TransportError::InvalidArgument(format!(
            "invalid topic filter '{filter}': {reason}"
        )))
    };

    if filter.is_empty() {
        return invalid("must not be empty");
    }

    let levels_part = if filter.starts_with(SHARED_PREFIX) || filter == "$share" {
        match split_shared(filter) {
            Some((group, rest)) if !group.is_empty() && !rest.is_empty() => {
                if group.contains(['+', '#']) {
                    return invalid("share name must not contain wildcards");
                }
                rest
            }
            _ => return invalid("shared subscription needs a share name and a filter"),
        }
    } else {
        filter
    };

    let mut levels = levels_part.split(LEVEL_SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != MULTI_LEVEL_WILDCARD || levels.peek().is_some()) {
            return invalid("'#' must be the whole last level");
        }
        if level.contains('+') && level != SINGLE_LEVEL_WILDCARD {
            return invalid("'+' must occupy a whole level");
        }
    }
    Ok(())
}

/// Whether `topic` is matched by `filter`.
///
/// `#` also matches the parent level (`a/#` matches `a`). Filters starting
/// with a wildcard never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter = matching_part(filter);
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
