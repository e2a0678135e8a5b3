//! Subjects: dot-separated routing keys.
//!
//! Patterns may use `*` for exactly one token and `>` (last token only) for
//! one or more trailing tokens.

use crate::log::LogError;

pub const JOBS_CREATE_REQUEST: &str = "jobs.create_request";
pub const JOBS_CREATED: &str = "jobs.created";
pub const JOBS_STATUS_UPDATE_REQUEST: &str = "jobs.status_update_request";
pub const CV_GENERATE_REQUEST: &str = "cv.generate_request";
pub const CV_GENERATED: &str = "jobs.cvgenerated";
pub const COVER_GENERATE_REQUEST: &str = "cover.generate_request";
pub const COVER_GENERATED: &str = "cover.generated";
pub const SCORE_GENERATE_REQUEST: &str = "score.generate_request";
pub const PROMPTS_CREATE_REQUEST: &str = "prompts.create_request";
pub const PROMPTS_UPDATE_REQUEST: &str = "prompts.update_request";

const DEAD_LETTER_PREFIX: &str = "deadletter";

/// Subject a message is parked on once its redelivery cap is exhausted.
pub fn dead_letter_subject(original: &str) -> String {
    format!("{}.{}", DEAD_LETTER_PREFIX, original)
}

/// Pattern covering every dead-letter subject.
pub fn dead_letter_pattern() -> String {
    format!("{}.>", DEAD_LETTER_PREFIX)
}

pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A concrete subject: non-empty tokens, no wildcards.
pub fn validate_subject(subject: &str) -> Result<(), LogError> {
    for token in subject.split('.') {
        if token.is_empty() || token.contains(['*', '>']) || token.contains(char::is_whitespace) {
            return Err(LogError::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

pub fn validate_pattern(pattern: &str) -> Result<(), LogError> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        let bad = match *token {
            "" => true,
            "*" => false,
            ">" => i + 1 != tokens.len(),
            t => t.contains(['*', '>']) || t.contains(char::is_whitespace),
        };
        if bad {
            return Err(LogError::InvalidSubject(pattern.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wildcards() {
        assert!(subject_matches("jobs.*", "jobs.created"));
        assert!(subject_matches("jobs.*", "jobs.cvgenerated"));
        assert!(!subject_matches("jobs.*", "jobs"));
        assert!(!subject_matches("jobs.*", "jobs.created.extra"));
        assert!(!subject_matches("cv.*", "jobs.cvgenerated"));
        assert!(subject_matches("deadletter.>", "deadletter.jobs.created"));
        assert!(!subject_matches("deadletter.>", "deadletter"));
        assert!(subject_matches(JOBS_CREATED, JOBS_CREATED));
    }

    #[test]
    fn validation() {
        assert!(validate_subject("jobs.created").is_ok());
        assert!(validate_subject("jobs.*").is_err());
        assert!(validate_subject("jobs..created").is_err());
        assert!(validate_subject("").is_err());

        assert!(validate_pattern("jobs.*").is_ok());
        assert!(validate_pattern("deadletter.>").is_ok());
        assert!(validate_pattern("a.>.b").is_err());
        assert!(validate_pattern("a.b*").is_err());
    }

    #[test]
    fn dead_letter_subjects_fall_under_pattern() {
        let subject = dead_letter_subject(CV_GENERATE_REQUEST);
        assert_eq!(subject, "deadletter.cv.generate_request");
        assert!(subject_matches(&dead_letter_pattern(), &subject));
    }

    fn subject_strategy() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-z_]{1,8}", 1..5)
    }

    proptest! {
        #[test]
        fn literal_subject_matches_itself(tokens in subject_strategy()) {
            let subject = tokens.join(".");
            prop_assert!(validate_subject(&subject).is_ok());
            prop_assert!(subject_matches(&subject, &subject));
        }

        #[test]
        fn star_matches_exactly_one_token(tokens in subject_strategy()) {
            let subject = tokens.join(".");
            let mut pattern_tokens = tokens.clone();
            let last = pattern_tokens.len() - 1;
            pattern_tokens[last] = "*".to_string();
            prop_assert!(subject_matches(&pattern_tokens.join("."), &subject));

            let longer = format!("{}.tail", subject);
            prop_assert!(!subject_matches(&pattern_tokens.join("."), &longer));
        }

        #[test]
        fn tail_wildcard_matches_any_extension(tokens in subject_strategy(), extra in subject_strategy()) {
            let prefix = tokens.join(".");
            let subject = format!("{}.{}", prefix, extra.join("."));
            let pattern = format!("{}.>", prefix);
            prop_assert!(subject_matches(&pattern, &subject));
            prop_assert!(!subject_matches(&pattern, &prefix));
        }
    }
}
