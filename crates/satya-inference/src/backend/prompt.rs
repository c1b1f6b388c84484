//! Prompt templates and text post-processing.

use crate::config::{BackendKind, Task};
use crate::types::InferenceRequest;

use super::runtime::Prompt;

/// Context budget (chars) for generative answer prompts.
pub const ANSWER_CONTEXT_CHARS: usize = 1500;
/// Context budget (chars) for generative hint prompts.
pub const HINT_CONTEXT_CHARS: usize = 1000;

/// Render the prompt for `kind`. `simplified` selects the shorter template
/// used by the adapter's internal retry.
pub fn render(kind: BackendKind, request: &InferenceRequest, simplified: bool) -> Prompt {
    let question = normalize_question(&request.question);
    let context = request.context.trim();

    let text = match (kind, request.task, simplified) {
        // Span readers consume question and context separately.
        (BackendKind::Extractive, _, _) => question.clone(),

        (BackendKind::Seq2Seq, Task::Hints, false) => format!(
            "Generate 3 short hints to help answer the following question.\nContext: {context}\nQuestion: {question}\nHints:"
        ),
        (BackendKind::Seq2Seq, Task::Hints, true) => {
            format!("hint: {question} context: {context}")
        }
        (BackendKind::Seq2Seq, Task::Answer, false) => {
            format!("question: {question} context: {context}")
        }
        (BackendKind::Seq2Seq, Task::Answer, true) => question.clone(),

        (BackendKind::Generative, Task::Answer, false) => format!(
            "You are a helpful educational assistant. Answer the following question based on the provided context. Be clear, concise, and accurate.\n{instruction}\n\nContext:\n{context}\n\nQuestion: {question}\n\nAnswer:",
            instruction = request.answer_length.instruction(),
            context = truncate_chars(context, ANSWER_CONTEXT_CHARS),
        ),
        (BackendKind::Generative, Task::Answer, true) => {
            format!("Question: {question}\nAnswer:")
        }
        (BackendKind::Generative, Task::Hints, false) => format!(
            "### Context:\n{context}\n\n### Question:\n{question}\n\n### Task:\nGenerate 3 concise hints to help answer the question. Each hint should be one sentence.\n\n### Hints:\n1.",
            context = truncate_chars(context, HINT_CONTEXT_CHARS),
        ),
        (BackendKind::Generative, Task::Hints, true) => format!(
            "Context: {context}\n\nQuestion: {question}\n\nGenerate 3 short, helpful hints to answer this question:\n1.",
            context = truncate_chars(context, HINT_CONTEXT_CHARS),
        ),
    };

    Prompt {
        text,
        question,
        context: context.to_string(),
        task: request.task,
        simplified,
    }
}

/// Sentence-case questions typed entirely in upper or lower case.
pub fn normalize_question(question: &str) -> String {
    let trimmed = question.trim();
    let has_upper = trimmed.chars().any(char::is_uppercase);
    let has_lower = trimmed.chars().any(char::is_lowercase);

    if has_upper != has_lower {
        capitalize(&trimmed.to_lowercase())
    } else {
        trimmed.to_string()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Cut `text` at the earliest stop marker.
pub fn truncate_at_stop<'a>(text: &'a str, stop: &[String]) -> &'a str {
    let cut = stop
        .iter()
        .filter(|marker| !marker.is_empty())
        .filter_map(|marker| text.find(marker.as_str()))
        .min()
        .unwrap_or(text.len());
    &text[..cut]
}

/// Trim and drop a leading `Answer:` artifact.
pub fn strip_answer_prefix(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.get(..7) {
        Some(head) if head.eq_ignore_ascii_case("answer:") => trimmed[7..].trim_start(),
        _ => trimmed,
    }
}

/// Outputs shorter than this (in chars, after trimming) count as empty.
pub const MIN_OUTPUT_CHARS: usize = 2;

pub fn is_effectively_empty(text: &str) -> bool {
    text.trim().chars().count() < MIN_OUTPUT_CHARS
}

/// Split model output into individual hints.
///
/// Numbering and bullets are stripped. Output with fewer than three lines
/// is split into sentences instead.
pub fn parse_hints(text: &str) -> Vec<String> {
    let lines: Vec<String> = text
        .lines()
        .map(strip_list_marker)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    let hints = if lines.len() >= 3 {
        lines
    } else {
        lines
            .iter()
            .flat_map(|line| split_sentences(line))
            .map(strip_list_marker)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };

    hints
        .into_iter()
        .filter(|hint| hint.chars().count() >= 5)
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line.trim_start_matches(['-', '*', '•']).trim_start();

    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return rest.trim();
        }
    }
    line
}

/// Split on sentence terminators, keeping the terminator.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    for (idx, ch) in text.char_indices() {
        if matches!(ch, '.' | '!' | '?') {
            let end = idx + ch.len_utf8();
            let at_boundary = bytes
                .get(end)
                .is_none_or(|next| next.is_ascii_whitespace());
            if at_boundary {
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
        } else if ch == '\n' {
            let sentence = text[start..idx].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = idx + 1;
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnswerLength;

    #[test]
    fn test_normalize_question() {
        assert_eq!(normalize_question("  WHAT IS A CELL?  "), "What is a cell?");
        assert_eq!(normalize_question("what is a cell?"), "What is a cell?");
        assert_eq!(normalize_question("What is DNA?"), "What is DNA?");
        assert_eq!(normalize_question(""), "");
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_truncate_at_stop() {
        let stop = vec!["###".to_string(), "\n\n".to_string()];
        assert_eq!(truncate_at_stop("Cells divide.\n\nQuestion: next", &stop), "Cells divide.");
        assert_eq!(truncate_at_stop("no markers", &stop), "no markers");
    }

    #[test]
    fn test_strip_answer_prefix() {
        assert_eq!(strip_answer_prefix("  Answer: Paris"), "Paris");
        assert_eq!(strip_answer_prefix("ANSWER:Paris"), "Paris");
        assert_eq!(strip_answer_prefix("Paris"), "Paris");
        assert!(is_effectively_empty(strip_answer_prefix("Answer: ")));
    }

    #[test]
    fn test_parse_numbered_hints() {
        let text = "1. Look at the first paragraph.\n2) Compare the two numbers.\n- Think about units.";
        assert_eq!(
            parse_hints(text),
            vec![
                "Look at the first paragraph.",
                "Compare the two numbers.",
                "Think about units."
            ]
        );
    }

    #[test]
    fn test_parse_single_paragraph_splits_sentences() {
        let text = "Photosynthesis needs light. Chlorophyll absorbs it! What gas is released?";
        assert_eq!(parse_hints(text).len(), 3);
    }

    #[test]
    fn test_parse_drops_fragments() {
        assert!(parse_hints("1.\n2. ok\n3.").is_empty());
    }

    #[test]
    fn test_render_generative_answer() {
        let request = InferenceRequest::answer("what is osmosis?", "Osmosis is diffusion of water.")
            .with_answer_length(AnswerLength::Short);
        let prompt = render(BackendKind::Generative, &request, false);
        assert!(prompt.text.starts_with("You are a helpful educational assistant."));
        assert!(prompt.text.contains(AnswerLength::Short.instruction()));
        assert!(prompt.text.contains("Question: What is osmosis?"));
        assert!(prompt.text.ends_with("Answer:"));

        let retry = render(BackendKind::Generative, &request, true);
        assert_eq!(retry.text, "Question: What is osmosis?\nAnswer:");
        assert!(retry.simplified);
    }

    #[test]
    fn test_render_truncates_hint_context() {
        let context = "x".repeat(5000);
        let request = InferenceRequest::hints("Why?", context);
        let prompt = render(BackendKind::Generative, &request, false);
        assert!(prompt.text.len() < 1300);
        assert!(prompt.text.ends_with("### Hints:\n1."));
        assert_eq!(prompt.context.len(), 5000);
    }
}
