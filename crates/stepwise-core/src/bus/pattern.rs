//! Topic patterns for result subscriptions.
//!
//! Patterns use glob syntax over topic names: `*` matches any run of
//! characters (including none), `?` a single character. `workflow:*` matches
//! every lifecycle topic and `workflow:content-*` only those of matching
//! definitions.

use glob::Pattern;

use super::BusError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    pattern: Pattern,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        if pattern.trim().is_empty() {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
        let compiled = Pattern::new(pattern)
            .map_err(|e| BusError::InvalidPattern(format!("{pattern}: {}", e.msg)))?;
        Ok(Self {
            raw: pattern.to_string(),
            pattern: compiled,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.pattern.matches(topic)
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, topic: &str) -> bool {
        TopicPattern::parse(pattern).unwrap().matches(topic)
    }

    #[test]
    fn exact_topics() {
        assert!(matches("workflow:content", "workflow:content"));
        assert!(!matches("workflow:content", "workflow:content-2"));
    }

    #[test]
    fn trailing_wildcard() {
        assert!(matches("workflow:*", "workflow:content"));
        assert!(matches("workflow:*", "workflow:"));
        assert!(!matches("workflow:*", "analyst"));
    }

    #[test]
    fn wildcards_anywhere() {
        assert!(matches("*", "anything"));
        assert!(matches("workflow:*-pipeline", "workflow:content-pipeline"));
        assert!(!matches("workflow:*-pipeline", "workflow:content-pipe"));
        assert!(matches("*:content*", "workflow:content-pipeline"));
        assert!(matches("a*b*c", "aXbYc"));
        assert!(!matches("a*b*c", "aXcYb"));
    }

    #[test]
    fn overlapping_prefix_and_suffix() {
        assert!(!matches("ab*ba", "aba"));
        assert!(matches("ab*ba", "abba"));
    }

    #[test]
    fn single_character_wildcard() {
        assert!(matches("workflow:v?", "workflow:v2"));
        assert!(!matches("workflow:v?", "workflow:v10"));
    }

    #[test]
    fn empty_or_malformed_pattern_is_rejected() {
        assert!(matches!(TopicPattern::parse(""), Err(BusError::InvalidPattern(_))));
        assert!(matches!(TopicPattern::parse("  "), Err(BusError::InvalidPattern(_))));
        assert!(matches!(TopicPattern::parse("workflow:[a"), Err(BusError::InvalidPattern(_))));
    }
}
