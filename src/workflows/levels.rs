use std::fmt;

use serde::{Deserialize, Serialize};

/// Learner knowledge level, ordered from easiest to hardest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Difficulty {
    #[default]
    #[serde(rename = "Beginner")]
    Beginner,
    #[serde(rename = "Early Learner")]
    EarlyLearner,
    #[serde(rename = "Good Knowledge")]
    GoodKnowledge,
    #[serde(rename = "Advanced")]
    Advanced,
}

impl Difficulty {
    pub const ALL: [Difficulty; 4] = [
        Difficulty::Beginner,
        Difficulty::EarlyLearner,
        Difficulty::GoodKnowledge,
        Difficulty::Advanced,
    ];

    pub const MIN_VALUE: u8 = 0;
    pub const MAX_VALUE: u8 = 3;

    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Difficulty::Beginner => "Beginner",
            Difficulty::EarlyLearner => "Early Learner",
            Difficulty::GoodKnowledge => "Good Knowledge",
            Difficulty::Advanced => "Advanced",
        }
    }

    /// Parse a level key such as `beginner`, `Early Learner` or
    /// `good_knowledge`.
    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_lowercase().replace(['_', '-'], " ");
        Self::ALL.into_iter().find(|d| d.name().to_lowercase() == key)
    }

    /// Like [`Difficulty::from_key`], falling back to `Beginner`.
    pub fn normalize(key: &str) -> Self {
        Self::from_key(key).unwrap_or_default()
    }

    /// Word count an exposition at this level should aim for.
    pub fn target_words(level: Option<Self>) -> usize {
        level.map_or(400, |d| (d.value() as usize + 1) * 200)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_normalize() {
        assert_eq!(Difficulty::from_key("beginner"), Some(Difficulty::Beginner));
        assert_eq!(Difficulty::from_key("Early Learner"), Some(Difficulty::EarlyLearner));
        assert_eq!(Difficulty::from_key("good_knowledge"), Some(Difficulty::GoodKnowledge));
        assert_eq!(Difficulty::from_key(" ADVANCED "), Some(Difficulty::Advanced));
        assert_eq!(Difficulty::from_key("expert"), None);
        assert_eq!(Difficulty::normalize("expert"), Difficulty::Beginner);
    }

    #[test]
    fn values_round_the_scale() {
        assert_eq!(Difficulty::Beginner.value(), Difficulty::MIN_VALUE);
        assert_eq!(Difficulty::Advanced.value(), Difficulty::MAX_VALUE);
        assert_eq!(Difficulty::from_value(2), Some(Difficulty::GoodKnowledge));
        assert_eq!(Difficulty::from_value(4), None);
    }

    #[test]
    fn target_words_scale_with_level() {
        assert_eq!(Difficulty::target_words(Some(Difficulty::Beginner)), 200);
        assert_eq!(Difficulty::target_words(Some(Difficulty::Advanced)), 800);
        assert_eq!(Difficulty::target_words(None), 400);
    }

    #[test]
    fn serializes_display_name() {
        assert_eq!(
            serde_json::to_value(Difficulty::GoodKnowledge).unwrap(),
            serde_json::json!("Good Knowledge")
        );
    }
}
