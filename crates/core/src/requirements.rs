//! Sanitization of the free-text customization a user attaches to a job.
//!
//! The text ends up inside a generation prompt, so it is bounded in length,
//! stripped of control characters and rejected when it looks like an
//! injection attempt.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{DomainError, DomainResult};

/// Upper bound on sanitized requirements, in characters.
pub const MAX_REQUIREMENTS_CHARS: usize = 2000;

static SQL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(?:UNION|SELECT|INSERT|UPDATE|DELETE|DROP|TRUNCATE|ALTER|CREATE|EXEC)\s+(?:FROM|INTO|TABLE|DATABASE)",
        r"(?i)(?:--|;)\s*(?:UNION|SELECT|DROP)",
        r"(?i)'\s*(?:OR|AND)\s*'?[^']*'?=",
        r#"(?i)[";]\s*(?:OR|AND)\s*"?\s*1\s*=\s*1"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid sql pattern"))
    .collect()
});

static SCRIPT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)<\s*script[^>]*>",
        r"(?i)javascript\s*:",
        r#"(?i)\bon\w+\s*=\s*["']?[^"']*["']?"#,
        r"\{\s*\{.*?\}\s*\}",
        r"__proto__",
        r"(?i)constructor\s*\[",
        r"(?i)eval\s*\(",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid script pattern"))
    .collect()
});

/// Normalize user requirements for prompt use.
///
/// Returns `Ok(None)` for absent or blank input. Control characters are
/// dropped and whitespace runs collapse to a single space.
pub fn sanitize_requirements(raw: Option<&str>) -> DomainResult<Option<String>> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    let cleaned = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.is_empty() {
        return Ok(None);
    }

    let len = cleaned.chars().count();
    if len > MAX_REQUIREMENTS_CHARS {
        return Err(DomainError::validation(format!(
            "requirements must be {MAX_REQUIREMENTS_CHARS} characters or less (got {len})"
        )));
    }

    if SQL_PATTERNS.iter().any(|re| re.is_match(&cleaned)) {
        return Err(DomainError::validation(
            "requirements contain SQL-like patterns",
        ));
    }
    if SCRIPT_PATTERNS.iter().any(|re| re.is_match(&cleaned)) {
        return Err(DomainError::validation(
            "requirements contain script-like patterns",
        ));
    }

    Ok(Some(cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blank_input_is_absent() {
        assert_eq!(sanitize_requirements(None).unwrap(), None);
        assert_eq!(sanitize_requirements(Some("  \n\t ")).unwrap(), None);
    }

    #[test]
    fn whitespace_and_control_characters_are_normalized() {
        let out = sanitize_requirements(Some("  Keep it\u{0007} light,\n\n focus   on  chapter 3 "))
            .unwrap()
            .unwrap();
        assert_eq!(out, "Keep it light, focus on chapter 3");
    }

    #[test]
    fn overlong_input_is_rejected() {
        let raw = "a".repeat(MAX_REQUIREMENTS_CHARS + 1);
        assert!(matches!(
            sanitize_requirements(Some(&raw)),
            Err(DomainError::Validation(_))
        ));

        let raw = "a".repeat(MAX_REQUIREMENTS_CHARS);
        assert!(sanitize_requirements(Some(&raw)).unwrap().is_some());
    }

    #[test]
    fn injection_patterns_are_rejected() {
        for raw in [
            "'; DROP TABLE podcasts; --",
            "x' OR '1'='1",
            "<script>alert(1)</script>",
            "use {{ secrets }} please",
            "javascript:void(0)",
            "eval(payload)",
        ] {
            assert!(
                sanitize_requirements(Some(raw)).is_err(),
                "expected rejection for {raw:?}"
            );
        }
    }

    #[test]
    fn ordinary_requests_pass() {
        for raw in [
            "Make it friendly for high-school students.",
            "Spend more time on the methodology section; skip the appendix.",
            "Select the three most surprising findings.",
        ] {
            assert!(sanitize_requirements(Some(raw)).unwrap().is_some(), "{raw}");
        }
    }

    proptest! {
        #[test]
        fn sanitized_output_is_bounded_and_clean(raw in "\\PC{0,300}") {
            if let Ok(Some(out)) = sanitize_requirements(Some(&raw)) {
                prop_assert!(out.chars().count() <= MAX_REQUIREMENTS_CHARS);
                prop_assert!(!out.chars().any(|c| c.is_control()));
                prop_assert!(!out.contains("  "));
                prop_assert_eq!(out.trim(), out.as_str());
            }
        }
    }
}
