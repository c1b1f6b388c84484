//! WordPiece encoding and span decoding for BERT-family question answering
//! graphs.
//!
//! The compiled extractive path feeds `[CLS] question [SEP] context [SEP]`
//! to the graph and gets back per-token start and end logits. This module
//! builds that input from a `vocab.txt` and maps the winning token span back
//! to a byte range of the original context.

use std::collections::HashMap;
use std::path::Path;

use super::builtin::softmax_at;

/// Words longer than this encode as `[UNK]`.
const MAX_WORD_CHARS: usize = 100;

/// Question tokens kept before the context is appended.
const MAX_QUESTION_TOKENS: usize = 64;

#[derive(Debug, Clone)]
pub struct WordPieceVocab {
    ids: HashMap<String, i64>,
    lowercase: bool,
    cls: i64,
    sep: i64,
    unk: i64,
}

impl WordPieceVocab {
    /// Parse a one-token-per-line vocabulary. Line number is the token id.
    pub fn parse(text: &str, lowercase: bool) -> Result<Self, String> {
        let ids: HashMap<String, i64> = text
            .lines()
            .enumerate()
            .map(|(i, token)| (token.trim_end_matches('\r').to_string(), i as i64))
            .collect();

        let special = |token: &str| {
            ids.get(token)
                .copied()
                .ok_or_else(|| format!("vocabulary has no {token} token"))
        };
        Ok(Self {
            cls: special("[CLS]")?,
            sep: special("[SEP]")?,
            unk: special("[UNK]")?,
            ids,
            lowercase,
        })
    }

    pub fn from_file(path: &Path, lowercase: bool) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::parse(&text, lowercase)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Greedy longest-match-first split of one word.
    fn encode_word(&self, word: &str, out: &mut Vec<i64>) {
        let word = if self.lowercase {
            word.to_lowercase()
        } else {
            word.to_string()
        };
        if word.chars().count() > MAX_WORD_CHARS {
            out.push(self.unk);
            return;
        }

        let mut pieces = Vec::new();
        let mut start = 0;
        while start < word.len() {
            let mut end = word.len();
            let mut found = None;
            while start < end {
                let piece = &word[start..end];
                let id = if start == 0 {
                    self.ids.get(piece)
                } else {
                    self.ids.get(&format!("##{piece}"))
                };
                if let Some(&id) = id {
                    found = Some(id);
                    break;
                }
                end = word[..end]
                    .char_indices()
                    .next_back()
                    .map(|(i, _)| i)
                    .unwrap_or(start);
            }
            match found {
                Some(id) => {
                    pieces.push(id);
                    start = end;
                }
                None => {
                    out.push(self.unk);
                    return;
                }
            }
        }
        out.extend(pieces);
    }

    /// Encode a question/context pair, truncating the context so the whole
    /// sequence fits in `max_len` tokens.
    pub fn encode_pair(&self, question: &str, context: &str, max_len: usize) -> Encoding {
        let mut input_ids = vec![self.cls];
        for (start, end) in basic_tokenize(question) {
            self.encode_word(&question[start..end], &mut input_ids);
        }
        input_ids.truncate(1 + MAX_QUESTION_TOKENS);
        input_ids.push(self.sep);
        let mut offsets = vec![None; input_ids.len()];

        let room = max_len.saturating_sub(input_ids.len() + 1);
        let mut taken = 0;
        let mut piece = Vec::new();
        'words: for (start, end) in basic_tokenize(context) {
            piece.clear();
            self.encode_word(&context[start..end], &mut piece);
            for &id in &piece {
                if taken == room {
                    break 'words;
                }
                input_ids.push(id);
                offsets.push(Some((start, end)));
                taken += 1;
            }
        }

        input_ids.push(self.sep);
        offsets.push(None);
        Encoding {
            attention_mask: vec![1; input_ids.len()],
            input_ids,
            offsets,
        }
    }
}

/// Model input for one question/context pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    /// Byte range in the context of the word each token came from;
    /// `None` for question and special tokens
    pub offsets: Vec<Option<(usize, usize)>>,
}

impl Encoding {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn context_tokens(&self) -> usize {
        self.offsets.iter().filter(|o| o.is_some()).count()
    }
}

/// Answer span chosen from the graph's logits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    /// Byte range in the context
    pub start: usize,
    pub end: usize,
    /// Softmax mass of the chosen start and end over context tokens
    pub start_probability: f64,
    pub end_probability: f64,
}

/// Highest scoring `start <= end` span of at most `max_tokens` context
/// tokens.
pub fn best_span(
    encoding: &Encoding,
    start_logits: &[f32],
    end_logits: &[f32],
    max_tokens: usize,
) -> Option<Span> {
    if start_logits.len() < encoding.len() || end_logits.len() < encoding.len() {
        return None;
    }
    let context: Vec<usize> = (0..encoding.len())
        .filter(|&i| encoding.offsets[i].is_some())
        .collect();

    let mut best: Option<(usize, usize, f32)> = None;
    for si in 0..context.len() {
        for ei in si..context.len().min(si + max_tokens.max(1)) {
            let score = start_logits[context[si]] + end_logits[context[ei]];
            if best.is_none_or(|(_, _, top)| score > top) {
                best = Some((si, ei, score));
            }
        }
    }
    let (si, ei, _) = best?;

    let starts: Vec<f64> = context.iter().map(|&i| f64::from(start_logits[i])).collect();
    let ends: Vec<f64> = context.iter().map(|&i| f64::from(end_logits[i])).collect();
    let (start, _) = encoding.offsets[context[si]]?;
    let (_, end) = encoding.offsets[context[ei]]?;
    Some(Span {
        start,
        end,
        start_probability: softmax_at(&starts, si),
        end_probability: softmax_at(&ends, ei),
    })
}

/// Split on whitespace and isolate every punctuation character. Returns
/// byte ranges into `text`.
pub fn basic_tokenize(text: &str) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut word_start: Option<usize> = None;
    for (i, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            word_start.get_or_insert(i);
            continue;
        }
        if let Some(start) = word_start.take() {
            pieces.push((start, i));
        }
        if !ch.is_whitespace() {
            pieces.push((i, i + ch.len_utf8()));
        }
    }
    if let Some(start) = word_start {
        pieces.push((start, text.len()));
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: &str = "[PAD]\n[UNK]\n[CLS]\n[SEP]\nwhere\nis\nthe\ntower\n?\nit\nstands\nin\nparis\n.\neiff\n##el\n";

    fn vocab() -> WordPieceVocab {
        WordPieceVocab::parse(VOCAB, true).unwrap()
    }

    #[test]
    fn test_basic_tokenize_isolates_punctuation() {
        let text = "Where is it? In Paris.";
        let words: Vec<&str> = basic_tokenize(text).iter().map(|&(s, e)| &text[s..e]).collect();
        assert_eq!(words, vec!["Where", "is", "it", "?", "In", "Paris", "."]);
    }

    #[test]
    fn test_vocab_requires_special_tokens() {
        let err = WordPieceVocab::parse("[CLS]\n[SEP]\nhello\n", true).unwrap_err();
        assert!(err.contains("[UNK]"));
        assert_eq!(vocab().len(), 16);
    }

    #[test]
    fn test_subword_split_and_unknown() {
        let v = vocab();
        let mut ids = Vec::new();
        v.encode_word("Eiffel", &mut ids);
        assert_eq!(ids, vec![14, 15]);

        ids.clear();
        v.encode_word("Eiffelx", &mut ids);
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_encode_pair_layout() {
        let context = "It stands in Paris.";
        let enc = vocab().encode_pair("Where is the Eiffel tower?", context, 64);

        // [CLS] where is the eiff ##el tower ? [SEP] it stands in paris . [SEP]
        assert_eq!(enc.input_ids, vec![2, 4, 5, 6, 14, 15, 7, 8, 3, 9, 10, 11, 12, 13, 3]);
        assert_eq!(enc.attention_mask.len(), enc.len());
        assert_eq!(enc.context_tokens(), 5);
        assert_eq!(enc.offsets[8], None);
        assert_eq!(enc.offsets[12], Some((13, 18)));
        assert_eq!(enc.offsets[14], None);
    }

    #[test]
    fn test_encode_pair_truncates_context() {
        let context = "it stands in paris . it stands in paris .";
        let enc = vocab().encode_pair("where", context, 8);
        assert_eq!(enc.len(), 8);
        assert_eq!(enc.context_tokens(), 4);
        assert_eq!(enc.input_ids.last(), Some(&3));
    }

    #[test]
    fn test_best_span_maps_back_to_context() {
        let context = "It stands in Paris.";
        let enc = vocab().encode_pair("Where is the Eiffel tower?", context, 64);

        let mut start = vec![0.0_f32; enc.len()];
        let mut end = vec![0.0_f32; enc.len()];
        // Question tokens must never win even with the highest logits.
        start[1] = 50.0;
        end[1] = 50.0;
        start[11] = 6.0;
        end[12] = 6.0;

        let span = best_span(&enc, &start, &end, 30).unwrap();
        assert_eq!(&context[span.start..span.end], "in Paris");
        assert!(span.start_probability > 0.9);
        assert!(span.end_probability > 0.9);
    }

    #[test]
    fn test_best_span_respects_length_and_order() {
        let context = "It stands in Paris.";
        let enc = vocab().encode_pair("where", context, 64);
        let first = enc.offsets.iter().position(Option::is_some).unwrap();

        let mut start = vec![0.0_f32; enc.len()];
        let mut end = vec![0.0_f32; enc.len()];
        start[first] = 9.0;
        end[first + 3] = 9.0;

        let full = best_span(&enc, &start, &end, 30).unwrap();
        assert_eq!(&context[full.start..full.end], "It stands in Paris");

        let short = best_span(&enc, &start, &end, 2).unwrap();
        assert_eq!(&context[short.start..short.end], "It");

        assert!(best_span(&enc, &start[..2], &end, 30).is_none());
    }
}
