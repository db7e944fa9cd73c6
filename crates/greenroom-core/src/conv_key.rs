//! Conversation key derivation.
//!
//! A [`ConvKey`] identifies "this specific group of entities talking". It is
//! derived from the *set* of participant identifiers: order and duplication
//! in the input never change the key, so any two intents naming the same
//! group collide on the same key and are serialized by the reservation
//! kernel.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator joining participant ids inside a conversation key.
///
/// Participant ids must not contain this character; [`ParticipantId::new`]
/// strips it on construction.
pub const CONV_KEY_SEPARATOR: char = '|';

/// Identifier of a single conversation participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Creates a participant id, stripping the reserved separator character.
    pub fn new(id: impl Into<String>) -> Self {
        let id: String = id.into();
        if id.contains(CONV_KEY_SEPARATOR) {
            Self(id.replace(CONV_KEY_SEPARATOR, "_"))
        } else {
            Self(id)
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sorts and deduplicates a participant list into a canonical roster.
    ///
    /// The returned roster is what a [`ConvKey`] is derived from and what a
    /// ticket records: distinct ids in ascending order.
    #[must_use]
    pub fn normalize(participants: &[Self]) -> Vec<Self> {
        let mut roster: Vec<Self> = participants.to_vec();
        roster.sort();
        roster.dedup();
        roster
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Deterministic, order-independent key for a group of participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConvKey(String);

impl ConvKey {
    /// Derives the key for a participant set.
    ///
    /// Sorts, deduplicates, and joins the ids, so
    /// `derive(["b", "a", "a"]) == derive(["a", "b"])`.
    #[must_use]
    pub fn derive(participants: &[ParticipantId]) -> Self {
        Self::from_roster(&ParticipantId::normalize(participants))
    }

    /// Builds the key from an already-normalized roster.
    ///
    /// Callers that have normalized once (the coordinator does, to validate
    /// the distinct-participant count) use this to avoid re-sorting.
    #[must_use]
    pub fn from_roster(roster: &[ParticipantId]) -> Self {
        debug_assert!(
            roster.windows(2).all(|w| w[0] < w[1]),
            "roster must be sorted and deduplicated"
        );
        let joined = roster
            .iter()
            .map(ParticipantId::as_str)
            .collect::<Vec<_>>()
            .join(&CONV_KEY_SEPARATOR.to_string());
        Self(joined)
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ids(names: &[&str]) -> Vec<ParticipantId> {
        names.iter().map(|n| ParticipantId::new(*n)).collect()
    }

    #[test]
    fn test_derive_sorts_and_dedupes() {
        let key = ConvKey::derive(&ids(&["b", "a", "a"]));
        assert_eq!(key.as_str(), "a|b");
        assert_eq!(key, ConvKey::derive(&ids(&["a", "b"])));
    }

    #[test]
    fn test_derive_single_participant() {
        let key = ConvKey::derive(&ids(&["solo"]));
        assert_eq!(key.as_str(), "solo");
    }

    #[test]
    fn test_separator_stripped_from_participant_id() {
        let id = ParticipantId::new("al|ice");
        assert_eq!(id.as_str(), "al_ice");
    }

    #[test]
    fn test_normalize_preserves_distinct_count() {
        let roster = ParticipantId::normalize(&ids(&["c", "a", "c", "b", "a"]));
        assert_eq!(roster.len(), 3);
        assert_eq!(roster, ids(&["a", "b", "c"]));
    }

    proptest! {
        /// Permuting or duplicating the participant list never changes the key.
        #[test]
        fn prop_conv_key_order_independent(
            mut names in proptest::collection::vec("[a-z]{1,8}", 1..6),
            dup_index in 0usize..6,
        ) {
            let original = ids(&names.iter().map(String::as_str).collect::<Vec<_>>());
            let baseline = ConvKey::derive(&original);

            let len = names.len().max(1);
            names.rotate_left(dup_index % len);
            if let Some(first) = names.first().cloned() {
                names.push(first);
            }
            let shuffled = ids(&names.iter().map(String::as_str).collect::<Vec<_>>());

            prop_assert_eq!(baseline, ConvKey::derive(&shuffled));
        }
    }
}
