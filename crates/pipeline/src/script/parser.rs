//! Line-oriented parser for generated dialogue scripts.
//!
//! A usable line is `<label>:<whitespace><text>` where `<label>` is a single
//! word naming one of the two speakers. Everything else is kept as a
//! [`ScriptLine::Skipped`] entry so callers can log why it was dropped.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+):(?:\s+(.*))?$").expect("valid script line pattern"));

static STAGE_DIRECTIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\*[^*]*\*").expect("valid stage direction pattern"));

/// The two roles of a conversation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    /// Leads the discussion and explains the material.
    Analyst,
    /// Asks questions and adds perspective.
    Commentator,
}

/// Maps speaker labels used in the script to roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTable {
    analyst: String,
    commentator: String,
}

impl RoleTable {
    pub const DEFAULT_ANALYST: &'static str = "DOROTHY";
    pub const DEFAULT_COMMENTATOR: &'static str = "WILL";

    /// Labels are compared case-insensitively; they are stored upper-case.
    pub fn new(analyst: impl AsRef<str>, commentator: impl AsRef<str>) -> Self {
        Self {
            analyst: analyst.as_ref().trim().to_uppercase(),
            commentator: commentator.as_ref().trim().to_uppercase(),
        }
    }

    pub fn lookup(&self, label: &str) -> Option<Speaker> {
        let label = label.to_uppercase();
        if label == self.analyst {
            Some(Speaker::Analyst)
        } else if label == self.commentator {
            Some(Speaker::Commentator)
        } else {
            None
        }
    }

    pub fn label(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::Analyst => &self.analyst,
            Speaker::Commentator => &self.commentator,
        }
    }
}

impl Default for RoleTable {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ANALYST, Self::DEFAULT_COMMENTATOR)
    }
}

/// One line of dialogue to synthesize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
}

/// Why a non-empty script line was not turned into an utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The line does not start with `<word>:` followed by whitespace.
    NoSpeakerLabel,
    /// The label is well-formed but names nobody in the role table.
    UnknownSpeaker(String),
    /// Nothing left to say once stage directions are removed.
    EmptyText,
}

impl core::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SkipReason::NoSpeakerLabel => f.write_str("no speaker label"),
            SkipReason::UnknownSpeaker(label) => write!(f, "unknown speaker {label}"),
            SkipReason::EmptyText => f.write_str("empty text"),
        }
    }
}

/// Parse result for one non-empty line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLine {
    Valid(Utterance),
    Skipped {
        /// 1-based line number in the raw script.
        line_no: usize,
        reason: SkipReason,
        raw: String,
    },
}

/// All non-empty lines of a script, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedScript {
    pub lines: Vec<ScriptLine>,
}

impl ParsedScript {
    pub fn utterances(&self) -> impl Iterator<Item = &Utterance> {
        self.lines.iter().filter_map(|line| match line {
            ScriptLine::Valid(u) => Some(u),
            ScriptLine::Skipped { .. } => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = (usize, &SkipReason, &str)> {
        self.lines.iter().filter_map(|line| match line {
            ScriptLine::Skipped {
                line_no,
                reason,
                raw,
            } => Some((*line_no, reason, raw.as_str())),
            ScriptLine::Valid(_) => None,
        })
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped().count()
    }

    pub fn into_utterances(self) -> Vec<Utterance> {
        self.lines
            .into_iter()
            .filter_map(|line| match line {
                ScriptLine::Valid(u) => Some(u),
                ScriptLine::Skipped { .. } => None,
            })
            .collect()
    }
}

/// Classify a single, already trimmed, non-empty line.
pub fn parse_line(line: &str, roles: &RoleTable) -> Result<Utterance, SkipReason> {
    let caps = LINE.captures(line).ok_or(SkipReason::NoSpeakerLabel)?;
    let label = &caps[1];
    let speaker = roles
        .lookup(label)
        .ok_or_else(|| SkipReason::UnknownSpeaker(label.to_uppercase()))?;

    let text = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let text = clean_text(text);
    if text.is_empty() {
        return Err(SkipReason::EmptyText);
    }
    Ok(Utterance { speaker, text })
}

/// Parse a whole script. Blank lines are ignored; order is preserved.
pub fn parse_script(script: &str, roles: &RoleTable) -> ParsedScript {
    let lines = script
        .lines()
        .enumerate()
        .filter_map(|(idx, raw)| {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            Some(match parse_line(trimmed, roles) {
                Ok(utterance) => ScriptLine::Valid(utterance),
                Err(reason) => ScriptLine::Skipped {
                    line_no: idx + 1,
                    reason,
                    raw: trimmed.to_string(),
                },
            })
        })
        .collect();
    ParsedScript { lines }
}

/// Drop `[bracketed]` and `*starred*` stage directions and normalize spacing.
fn clean_text(text: &str) -> String {
    STAGE_DIRECTIONS
        .replace_all(text, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn labels_are_case_insensitive() {
        let roles = RoleTable::default();
        let u = parse_line("Dorothy: Welcome back.", &roles).unwrap();
        assert_eq!(u.speaker, Speaker::Analyst);
        assert_eq!(u.text, "Welcome back.");

        let u = parse_line("will:\tGlad to be here!", &roles).unwrap();
        assert_eq!(u.speaker, Speaker::Commentator);
        assert_eq!(u.text, "Glad to be here!");
    }

    #[test]
    fn unknown_speaker_is_skipped() {
        let roles = RoleTable::default();
        assert_eq!(
            parse_line("Narrator: Hello", &roles),
            Err(SkipReason::UnknownSpeaker("NARRATOR".to_string()))
        );
    }

    #[test]
    fn lines_without_grammar_are_skipped() {
        let roles = RoleTable::default();
        for line in [
            "Welcome to the show",
            "**Dorothy:** Hello",
            "Dorothy:Hello",
            "Dorothy Smith: Hello",
            "- Will: hi",
        ] {
            assert_eq!(parse_line(line, &roles), Err(SkipReason::NoSpeakerLabel), "{line}");
        }
    }

    #[test]
    fn stage_directions_are_removed() {
        let roles = RoleTable::default();
        let u = parse_line("WILL: [laughs] That's *pauses* wild.", &roles).unwrap();
        assert_eq!(u.text, "That's wild.");

        assert_eq!(
            parse_line("DOROTHY: [sighs]", &roles),
            Err(SkipReason::EmptyText)
        );
        assert_eq!(parse_line("DOROTHY:", &roles), Err(SkipReason::EmptyText));
    }

    #[test]
    fn script_keeps_order_and_reports_skips() {
        let script = "Title: Tides\n\nDOROTHY: Tides move oceans.\nWILL: How?\nNarrator: (music)\n\nDOROTHY: The moon.\n";
        let parsed = parse_script(script, &RoleTable::default());

        let utterances: Vec<_> = parsed
            .utterances()
            .map(|u| (u.speaker, u.text.as_str()))
            .collect();
        assert_eq!(
            utterances,
            vec![
                (Speaker::Analyst, "Tides move oceans."),
                (Speaker::Commentator, "How?"),
                (Speaker::Analyst, "The moon."),
            ]
        );

        let skipped: Vec<_> = parsed.skipped().map(|(n, r, _)| (n, r.clone())).collect();
        assert_eq!(
            skipped,
            vec![
                (1, SkipReason::UnknownSpeaker("TITLE".to_string())),
                (5, SkipReason::UnknownSpeaker("NARRATOR".to_string())),
            ]
        );
    }

    #[test]
    fn custom_roles() {
        let roles = RoleTable::new("ada", "Grace");
        assert_eq!(roles.label(Speaker::Analyst), "ADA");
        assert_eq!(roles.lookup("grace"), Some(Speaker::Commentator));
        assert_eq!(roles.lookup("DOROTHY"), None);
    }

    proptest! {
        #[test]
        fn valid_lines_round_trip(
            analyst in any::<bool>(),
            text in "[A-Za-z0-9,.?!' ]{0,80}[A-Za-z0-9]",
        ) {
            let roles = RoleTable::default();
            let speaker = if analyst { Speaker::Analyst } else { Speaker::Commentator };
            let line = format!("{}: {}", roles.label(speaker), text);
            let u = parse_line(line.trim(), &roles).unwrap();
            prop_assert_eq!(u.speaker, speaker);
            prop_assert_eq!(u.text, text.split_whitespace().collect::<Vec<_>>().join(" "));
        }

        #[test]
        fn parsing_never_panics_and_texts_are_nonempty(script in "\\PC{0,400}") {
            let parsed = parse_script(&script, &RoleTable::default());
            for u in parsed.utterances() {
                prop_assert!(!u.text.trim().is_empty());
            }
        }
    }
}
