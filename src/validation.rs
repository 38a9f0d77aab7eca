//! Inbound payload shape and validation.
//!
//! Validation is side-effect free and always runs before the quota ledger
//! is consulted, so malformed requests never cost the caller anything.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::quota::Tier;
use crate::{GateError, Result};

/// Shortest accepted question, in characters.
pub const MIN_QUESTION_CHARS: usize = 10;

/// Longest accepted question, in characters.
pub const MAX_QUESTION_CHARS: usize = 1000;

/// JSON body of a doubt-solving request.
///
/// Every field is optional at the wire level so that absent fields surface
/// as [`GateError::MissingFields`] rather than a parse failure. A field of
/// the wrong JSON type reads as absent.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoubtRequest {
    /// Subject the question belongs to, e.g. `"Physics"`.
    #[serde(default, deserialize_with = "string_or_absent")]
    pub subject: Option<String>,
    /// The question itself.
    #[serde(default, deserialize_with = "string_or_absent")]
    pub question: Option<String>,
    /// Study level used to pitch the explanation, e.g. `"Class 12"`.
    #[serde(default, deserialize_with = "string_or_absent")]
    pub level: Option<String>,
    /// User id supplied by the identity collaborator.
    #[serde(default, deserialize_with = "string_or_absent")]
    pub user_id: Option<String>,
    /// Whether the identity collaborator considers the caller logged in.
    #[serde(default, deserialize_with = "bool_or_absent")]
    pub is_logged_in: Option<bool>,
}

fn string_or_absent<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(value)) => Some(value),
        _ => None,
    })
}

fn bool_or_absent<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(|value| value.as_bool()))
}

impl DoubtRequest {
    /// Returns the caller's user id, if a non-empty one was supplied.
    pub fn caller_id(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Returns the quota tier for this caller.
    ///
    /// Only a logged-in caller that also carries a user id is authenticated;
    /// a bare `isLoggedIn: true` is treated as anonymous.
    pub fn tier(&self) -> Tier {
        match (self.is_logged_in, self.caller_id()) {
            (Some(true), Some(_)) => Tier::Authenticated,
            _ => Tier::Anonymous,
        }
    }
}

/// The fields of a [`DoubtRequest`] that passed validation, unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDoubt {
    /// Non-empty subject.
    pub subject: String,
    /// Question of accepted length.
    pub question: String,
    /// Non-empty study level.
    pub level: String,
}

/// Checks that subject, question, and level are present and non-empty and
/// that the question is between [`MIN_QUESTION_CHARS`] and
/// [`MAX_QUESTION_CHARS`] characters inclusive.
pub fn validate(request: &DoubtRequest) -> Result<ValidatedDoubt> {
    fn present(field: &Option<String>) -> Option<&str> {
        field.as_deref().filter(|value| !value.is_empty())
    }

    let (Some(subject), Some(question), Some(level)) = (
        present(&request.subject),
        present(&request.question),
        present(&request.level),
    ) else {
        return Err(GateError::MissingFields);
    };

    let len = question.chars().count();
    if !(MIN_QUESTION_CHARS..=MAX_QUESTION_CHARS).contains(&len) {
        return Err(GateError::InvalidQuestionLength { len });
    }

    Ok(ValidatedDoubt {
        subject: subject.to_owned(),
        question: question.to_owned(),
        level: level.to_owned(),
    })
}
