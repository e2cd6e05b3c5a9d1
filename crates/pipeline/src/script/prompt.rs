//! Prompt templates for the three generation calls.

use super::parser::{RoleTable, Speaker};

/// First line of every summary prompt.
pub const SUMMARY_PREAMBLE: &str = "Analyze the following document and write a detailed, structured summary.";

/// First line of every dialogue prompt.
pub const DIALOGUE_PREAMBLE: &str = "You are a podcast scriptwriter producing a two-host conversation.";

/// First line of every title prompt.
pub const TITLE_PREAMBLE: &str = "Write a title for the podcast episode described by this summary.";

pub fn summary_prompt(source_text: &str) -> String {
    format!(
        "{SUMMARY_PREAMBLE}
The summary will be turned into a 15-30 minute podcast discussion that covers every major topic.

Identify:
1. The core thesis or main argument
2. The three to five most important topics or supporting points
3. Data, statistics or case studies the document relies on
4. The main conclusion or takeaway

Use only information found in the document. Do not make anything up.

---
{source_text}
---
"
    )
}

pub fn dialogue_prompt(
    summary: &str,
    roles: &RoleTable,
    target_words: u32,
    requirements: Option<&str>,
) -> String {
    let analyst = roles.label(Speaker::Analyst);
    let commentator = roles.label(Speaker::Commentator);

    let mut prompt = format!(
        "{DIALOGUE_PREAMBLE}
Hosts: {analyst} (an insightful analyst) and {commentator} (a curious commentator).
Target length: about {target_words} words, for a 15-30 minute episode.

Turn the summary below into a natural conversation between the two hosts.
- Work the thesis, key topics and important figures into the discussion.
- Vary sentence length and use questions to keep it lively.
- {analyst} explains and drives the main points forward.
- {commentator} asks what a listener would ask and keeps things accessible.

Format rules:
- Every line starts with the speaker label followed by a colon and a space, for example \"{analyst}: Welcome back.\"
- Only the labels {analyst} and {commentator} may be used.
- No stage directions, sound cues, headings or markdown.
"
    );

    if let Some(requirements) = requirements {
        prompt.push_str(&format!(
            "\nAdditional listener requirements (follow them unless they conflict with the format rules):\n{requirements}\n"
        ));
    }

    prompt.push_str(&format!("\nSummary:\n---\n{summary}\n---\n"));
    prompt
}

pub fn title_prompt(summary: &str) -> String {
    format!(
        "{TITLE_PREAMBLE}
Make it short, catchy and descriptive (5-10 words). Reply with the title only, without quotes.

Summary:
{summary}
"
    )
}

/// Reduce a model reply to a single clean title line.
pub fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line: String = line
        .chars()
        .filter(|c| !matches!(c, '"' | '*' | '#' | '“' | '”'))
        .collect();
    let line = line.trim_start();
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("TITLE:"))
        .unwrap_or(line);
    let cleaned = line.split_whitespace().collect::<Vec<_>>().join(" ");
    (!cleaned.is_empty()).then_some(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_start_with_their_preamble() {
        let roles = RoleTable::default();
        assert!(summary_prompt("text").starts_with(SUMMARY_PREAMBLE));
        assert!(dialogue_prompt("s", &roles, 1200, None).starts_with(DIALOGUE_PREAMBLE));
        assert!(title_prompt("s").starts_with(TITLE_PREAMBLE));
    }

    #[test]
    fn dialogue_prompt_names_roles_and_requirements() {
        let roles = RoleTable::default();
        let prompt = dialogue_prompt("the summary", &roles, 900, Some("Keep it light."));
        assert!(prompt.contains("DOROTHY: Welcome back."));
        assert!(prompt.contains("about 900 words"));
        assert!(prompt.contains("Keep it light."));
        assert!(prompt.trim_end().ends_with("---"));

        let prompt = dialogue_prompt("the summary", &roles, 900, None);
        assert!(!prompt.contains("listener requirements"));
    }

    #[test]
    fn titles_are_cleaned() {
        assert_eq!(
            clean_title("  \"The Moon's Quiet Pull\"\n").as_deref(),
            Some("The Moon's Quiet Pull")
        );
        assert_eq!(
            clean_title("\n**Title:** Tides,  Explained\nSecond line").as_deref(),
            Some("Tides, Explained")
        );
        assert_eq!(clean_title("Title: Tides").as_deref(), Some("Tides"));
        assert_eq!(clean_title(" \n \"\" "), None);
    }
}
