//! Topic matching
//!
//! Topic names are concrete (`sensors/kitchen/temp`); topic filters may
//! contain `+` (exactly one level) and `#` (zero or more trailing levels).
//! Levels are separated by `/`. Topics starting with `$` are reserved and
//! are only matched by filters whose first level spells out the `$` level.

use crate::utils::{BrokerError, Result};

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";
const MAX_TOPIC_LENGTH: usize = 65_535;

/// Returns true when `topic_name` is matched by `filter`.
///
/// `topic_name` must not contain wildcards. An invalid filter simply fails to
/// match; validation happens at subscribe time.
pub fn matches(filter: &str, topic_name: &str) -> bool {
    if topic_name.starts_with('$')
        && (filter.starts_with(SINGLE_LEVEL_WILDCARD) || filter.starts_with(MULTI_LEVEL_WILDCARD))
    {
        return false;
    }

    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic_name.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validates a concrete topic name carried by a PUBLISH.
pub fn validate_topic_name(topic_name: &str) -> Result<()> {
    if topic_name.is_empty()
        || topic_name.len() > MAX_TOPIC_LENGTH
        || topic_name.contains(['+', '#', '\0'])
    {
        return Err(BrokerError::InvalidTopicName(topic_name.to_string()));
    }
    Ok(())
}

/// Validates a SUBSCRIBE/UNSUBSCRIBE topic filter.
///
/// Wildcards must occupy a whole level, and `#` may only be the last level.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    let invalid = || BrokerError::InvalidTopicFilter(filter.to_string());

    if filter.is_empty() || filter.len() > MAX_TOPIC_LENGTH || filter.contains('\0') {
        return Err(invalid());
    }

    let mut levels = filter.split(LEVEL_SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        match level {
            MULTI_LEVEL_WILDCARD if levels.peek().is_some() => return Err(invalid()),
            MULTI_LEVEL_WILDCARD | SINGLE_LEVEL_WILDCARD => {}
            _ if level.contains(['+', '#']) => return Err(invalid()),
            _ => {}
        }
    }
    Ok(())
}

/// True if the filter contains `+` or `#` levels.
pub fn is_wildcard(filter: &str) -> bool {
    filter
        .split(LEVEL_SEPARATOR)
        .any(|level| level == SINGLE_LEVEL_WILDCARD || level == MULTI_LEVEL_WILDCARD)
}
