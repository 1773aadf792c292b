//! Prompts for the three decision-head stages.
//!
//! Each stage gets the shared base prompt plus its own instructions as the
//! system message, and a user message carrying only the material that stage
//! is allowed to see:
//! - Detector: salient feature clauses, never regulation text
//! - Policy Mapper: the Detector's spans and the retrieved sections
//! - Arbiter: both prior outputs plus the clauses and sections they cite

use geoguard_core::retrieval::RegulationSection;
use geoguard_core::{Clause, DetectorOutput, PolicyMapperOutput, Stage};

use crate::providers::ChatMessage;

/// Stamped into `metadata.runtime.prompt_version`. Bump on any prompt edit.
pub const PROMPT_VERSION: &str = "2024.09.1";

/// Base system prompt shared by every stage.
pub const BASE_SYSTEM_PROMPT: &str = r#"
You are a stage in GeoGuard, a geo-compliance screening pipeline.

The pipeline decides whether a product feature needs geo-specific logic
because a LAW requires it, as opposed to geo-specific logic for business
reasons (market tests, staged launches, performance, licensing deals).

## Constraints
1. Use ONLY the material in the user message. Do not rely on outside legal knowledge.
2. Every quote must be copied exactly, character for character, from the text given.
3. Regulations are limited to: DSA, CA-SB976, FL-Minors, UT-SMRA, US-NCMEC.
4. Control types are limited to: age_gating, parental_consent, reporting,
   content_restriction, data_localization, data_retention, notice_and_action,
   delivery_constraints.
5. Answer with a single JSON object matching the response schema. No prose.

A region mentioned without a legal rationale is NOT evidence of a legal requirement.
"#;

/// Detector instructions.
pub const DETECTOR_PROMPT: &str = r#"
## Stage: Detector

Question:
Does this feature describe geo-specific logic that exists to satisfy a legal
obligation (LEGAL), or geo-specific logic for business reasons (BUSINESS)?

Return:
- "label": "LEGAL" or "BUSINESS"
- "reason": one or two sentences citing the feature
- "feature_spans": short exact quotes from the ORIGINAL clause text

Quote the ORIGINAL text only. The expanded form is there to help you read
internal abbreviations; never quote it.
"#;

/// Policy Mapper instructions.
pub const POLICY_MAPPER_PROMPT: &str = r#"
## Stage: Policy Mapper

Question:
Which of the retrieved regulation sections, if any, does this feature evidence
implicate, and which controls would it require?

Return:
- "framing": "LEGAL" or "BUSINESS"
- "control_type": control types the feature implements
- "regulations": regulations whose sections you cite
- "reg_snippets": objects {"section_id", "quote"}; the quote must be copied
  exactly from that section's text, and the section must be one listed below
- "reason": one or two sentences

If no section applies, return empty lists. Never cite a section that is not listed.
"#;

/// Arbiter instructions.
pub const ARBITER_PROMPT: &str = r#"
## Stage: Arbiter

Question:
Given the Detector and Policy Mapper outputs, does this feature need
geo-specific compliance logic?

Return:
- "decision": "YES", "NO" or "REVIEW"
- "confidence": 0.0-1.0
- "reasoning_summary": one to three sentences referencing the quoted evidence
- "feature_spans", "reg_snippets", "regulations", "control_type": the evidence
  supporting the decision, quoted exactly from the material below

Rules:
- YES requires at least one regulation snippet.
- If evidence is weak or the two stages conflict, answer REVIEW.
"#;

pub fn stage_prompt(stage: Stage) -> &'static str {
    match stage {
        Stage::Detector => DETECTOR_PROMPT,
        Stage::PolicyMapper => POLICY_MAPPER_PROMPT,
        Stage::Arbiter => ARBITER_PROMPT,
    }
}

fn system_message(stage: Stage) -> ChatMessage {
    ChatMessage::system(format!(
        "{}\n{}",
        BASE_SYSTEM_PROMPT.trim(),
        stage_prompt(stage).trim()
    ))
}

fn render_clauses(out: &mut String, clauses: &[&Clause]) {
    for clause in clauses {
        out.push_str(&format!("[{}] {}\n", clause.clause_id, clause.quote.trim()));
        if clause.text != clause.quote.trim() {
            out.push_str(&format!("    (expanded: {})\n", clause.text));
        }
    }
}

fn render_sections(out: &mut String, sections: &[&RegulationSection]) {
    if sections.is_empty() {
        out.push_str("(no regulation section was retrieved)\n");
    }
    for section in sections {
        out.push_str(&format!("[{}] {}\n", section.section_id, section.regulation));
        if !section.heading.is_empty() {
            out.push_str(&format!("Heading: {}\n", section.heading.join(" > ")));
        }
        out.push_str(&format!("{}\n\n", section.text));
    }
}

fn render_quotes(out: &mut String, quotes: &[String]) {
    if quotes.is_empty() {
        out.push_str("(none)\n");
    }
    for quote in quotes {
        out.push_str(&format!("- \"{}\"\n", quote));
    }
}

fn render_detector(out: &mut String, detector: &DetectorOutput) {
    out.push_str(&format!("Label: {}\n", detector.label.as_str()));
    out.push_str(&format!("Reason: {}\n", detector.reason));
    out.push_str("Spans:\n");
    render_quotes(out, &detector.feature_spans);
}

fn render_mapper(out: &mut String, mapper: &PolicyMapperOutput) {
    let join = |items: Vec<&str>| {
        if items.is_empty() {
            "(none)".to_string()
        } else {
            items.join(", ")
        }
    };
    out.push_str(&format!("Framing: {}\n", mapper.framing.as_str()));
    out.push_str(&format!(
        "Control types: {}\n",
        join(mapper.control_type.iter().map(|c| c.as_str()).collect())
    ));
    out.push_str(&format!(
        "Regulations: {}\n",
        join(mapper.regulations.iter().map(|r| r.as_str()).collect())
    ));
    out.push_str(&format!("Reason: {}\n", mapper.reason));
    out.push_str("Snippets:\n");
    if mapper.reg_snippets.is_empty() {
        out.push_str("(none)\n");
    }
    for snippet in &mapper.reg_snippets {
        out.push_str(&format!("- [{}] \"{}\"\n", snippet.section_id, snippet.quote));
    }
}

/// Detector messages over the salient clauses.
pub fn detector_messages(feature_name: &str, clauses: &[&Clause]) -> Vec<ChatMessage> {
    let mut user = String::new();
    user.push_str(&format!("Feature: {}\n\n", feature_name));
    user.push_str("Feature clauses:\n");
    render_clauses(&mut user, clauses);
    vec![system_message(Stage::Detector), ChatMessage::user(user)]
}

/// Policy Mapper messages: Detector spans and retrieved sections only.
pub fn policy_mapper_messages(
    detector: &DetectorOutput,
    sections: &[&RegulationSection],
) -> Vec<ChatMessage> {
    let mut user = String::from("Feature evidence:\n");
    render_quotes(&mut user, &detector.feature_spans);
    user.push_str("\nRetrieved regulation sections:\n");
    render_sections(&mut user, sections);
    vec![system_message(Stage::PolicyMapper), ChatMessage::user(user)]
}

/// Arbiter messages over both prior outputs.
pub fn arbiter_messages(
    detector: &DetectorOutput,
    mapper: &PolicyMapperOutput,
    clauses: &[&Clause],
    sections: &[&RegulationSection],
) -> Vec<ChatMessage> {
    let mut user = String::from("Detector output:\n");
    render_detector(&mut user, detector);
    user.push_str("\nPolicy Mapper output:\n");
    render_mapper(&mut user, mapper);
    user.push_str("\nFeature clauses:\n");
    render_clauses(&mut user, clauses);
    user.push_str("\nRetrieved regulation sections:\n");
    render_sections(&mut user, sections);
    vec![system_message(Stage::Arbiter), ChatMessage::user(user)]
}

/// Follow-up sent after a reply failed validation.
pub fn schema_retry_follow_up(violations: &[String]) -> ChatMessage {
    let mut text = String::from("Your previous answer was rejected for these reasons:\n");
    for violation in violations {
        text.push_str(&format!("- {}\n", violation));
    }
    text.push_str(
        "\nAnswer again with a single JSON object matching the schema. \
         Copy every quote exactly from the material given.",
    );
    ChatMessage::user(text)
}
