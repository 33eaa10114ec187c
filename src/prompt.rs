//! Few-shot prompt construction.

use crate::llm::ChatMessage;
use crate::models::SampleMatch;

const SYSTEM_PROMPT: &str =
    "You label customer support conversations. Always respond with a single JSON object.";

const RULES_HEADER: &str = "## Labeling rules";
const SAMPLES_HEADER: &str = "## Reference samples";
const CONVERSATION_HEADER: &str = "## Conversation";
const REUSE_RULE: &str = "Reuse labels from the reference samples whenever one fits";
const RESPONSE_FORMAT: &str = "Respond with a JSON object with keys";

/// Phrases that only occur in our own prompt. A model summary containing any
/// of them has echoed the instructions instead of summarizing.
pub const GUIDANCE_MARKERS: &[&str] = &[
    RULES_HEADER,
    SAMPLES_HEADER,
    CONVERSATION_HEADER,
    REUSE_RULE,
    RESPONSE_FORMAT,
];

pub fn contains_guidance(text: &str) -> bool {
    GUIDANCE_MARKERS.iter().any(|m| text.contains(m))
}

/// First `max_chars` characters of `text`, with `...` appended when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Build the `system` + `user` messages for one conversation.
///
/// `dialog` must already be redacted.
pub fn build_messages(
    dialog: &str,
    matches: &[SampleMatch],
    max_labels: usize,
    sample_text_chars: usize,
) -> Vec<ChatMessage> {
    let samples = if matches.is_empty() {
        "(no reference samples were found; choose a short, general label)".to_string()
    } else {
        matches
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let secondary = if m.label_secondary.is_empty() {
                    "-".to_string()
                } else {
                    m.label_secondary.join(", ")
                };
                format!(
                    "[{}] label: {} | secondary: {} | score: {:.3}\nsummary: {}",
                    i + 1,
                    m.label_primary,
                    secondary,
                    m.score,
                    truncate_chars(&m.summary, sample_text_chars)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let user = format!(
        "{RULES_HEADER}\n\
         - {REUSE_RULE}; invent a new label only when none applies.\n\
         - Return at most {max_labels} labels in total (label_primary plus label_secondary).\n\
         - Summarize the customer's issue in one or two sentences, in the conversation's language. Do not repeat these instructions.\n\
         - Personal data is masked with '*'; never try to reconstruct it.\n\
         \n\
         {SAMPLES_HEADER}\n\
         {samples}\n\
         \n\
         {CONVERSATION_HEADER}\n\
         {dialog}\n\
         \n\
         {RESPONSE_FORMAT}: label_primary (string), label_secondary (array of strings), \
         confidence (number between 0 and 1), summary (string), reasoning (string)."
    );

    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, label: &str, score: f32) -> SampleMatch {
        SampleMatch {
            sample_id: id.into(),
            label_primary: label.into(),
            label_secondary: vec!["결제".into()],
            score,
            summary: "환불 요청 ".repeat(100),
            snippet: None,
        }
    }

    #[test]
    fn prompt_lists_samples_with_scores() {
        let msgs = build_messages("user: 환불해주세요", &[sample("s1", "환불", 0.81234)], 2, 40);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        let user = &msgs[1].content;
        assert!(user.contains("[1] label: 환불 | secondary: 결제 | score: 0.812"));
        assert!(user.contains("at most 2 labels"));
        assert!(user.contains("user: 환불해주세요"));
        // summary truncated to 40 chars plus ellipsis
        let summary_line = user.lines().find(|l| l.starts_with("summary:")).unwrap();
        assert_eq!(summary_line.chars().count(), "summary: ".len() + 40 + 3);
    }

    #[test]
    fn zero_shot_prompt_says_so() {
        let msgs = build_messages("user: 안녕하세요", &[], 2, 400);
        assert!(msgs[1].content.contains("no reference samples"));
    }

    #[test]
    fn guidance_detection() {
        assert!(contains_guidance("## Labeling rules\n- reuse"));
        assert!(!contains_guidance("고객이 환불을 요청함"));
        let msgs = build_messages("d", &[], 2, 10);
        assert!(contains_guidance(&msgs[1].content));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("환불요청", 2), "환불...");
        assert_eq!(truncate_chars("환불", 2), "환불");
        assert_eq!(truncate_chars("", 5), "");
    }
}
