// Text Processing Service
// Normalization, sentence splitting and tokenization shared by every text feature

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

fn space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\u{3000}\u{00A0}]").expect("space regex"))
}

fn horizontal_ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t\x0C\x0B]+").expect("whitespace regex"))
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+(?:['\u{2019}][\p{L}]+)*").expect("word regex"))
}

/// Normalize punctuation and whitespace (smart quotes, dashes, odd spaces, line endings)
pub fn normalize_punctuation(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut s = text
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{2014}', '\u{2013}'], "-");

    s = space_re().replace_all(&s, " ").to_string();
    s = s.replace("\r\n", "\n").replace('\r', "\n");
    s = horizontal_ws_re().replace_all(&s, " ").to_string();

    s = s.lines().map(|ln| ln.trim()).collect::<Vec<_>>().join("\n");

    s.trim().to_string()
}

/// Sentence splitting that respects quotes and decimal numbers.
/// Fragments of 5 characters or fewer are dropped (list markers, stray abbreviations).
pub fn split_sentences(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec![];
    }

    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut buffer = String::new();
    let mut in_quote = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        buffer.push(ch);

        if ch == '"' {
            in_quote = !in_quote;
        }

        let is_terminal = matches!(ch, '.' | '!' | '?' | '。' | '！' | '？');
        let is_decimal = ch == '.'
            && i > 0
            && i + 1 < chars.len()
            && chars[i - 1].is_ascii_digit()
            && chars[i + 1].is_ascii_digit();

        if is_terminal && !in_quote && !is_decimal {
            // Absorb runs like "?!" or "..." into the same sentence.
            while i + 1 < chars.len() && matches!(chars[i + 1], '.' | '!' | '?') {
                i += 1;
                buffer.push(chars[i]);
            }
            push_sentence(&mut sentences, &buffer);
            buffer.clear();
        } else if ch == '\n' && i + 1 < chars.len() && chars[i + 1] == '\n' {
            // Blank line closes a sentence even without terminal punctuation.
            push_sentence(&mut sentences, &buffer);
            buffer.clear();
        }

        i += 1;
    }

    push_sentence(&mut sentences, &buffer);
    sentences
}

fn push_sentence(out: &mut Vec<String>, buffer: &str) {
    let trimmed = buffer.trim();
    if trimmed.chars().count() > 5 {
        out.push(trimmed.to_string());
    }
}

/// Lowercased word tokens
pub fn tokenize(text: &str) -> Vec<String> {
    word_re()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase().replace('\u{2019}', "'"))
        .collect()
}

/// Rough language tag used in remote scoring metadata
pub fn detect_language(text: &str) -> String {
    let cjk_count = text
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count();
    let total_chars = text.chars().filter(|c| !c.is_whitespace()).count();

    if total_chars > 0 && cjk_count as f64 / total_chars as f64 > 0.3 {
        "zh".to_string()
    } else {
        "en".to_string()
    }
}

/// Fraction of n-gram occurrences that repeat an earlier n-gram
pub fn ngram_repeat_rate(tokens: &[String], n: usize) -> f64 {
    if n == 0 || tokens.len() < n {
        return 0.0;
    }
    let mut counts: HashMap<&[String], usize> = HashMap::new();
    let mut total = 0usize;
    for window in tokens.windows(n) {
        *counts.entry(window).or_insert(0) += 1;
        total += 1;
    }
    let repeats = counts.values().filter(|&&c| c >= 2).map(|&c| c - 1).sum::<usize>();
    repeats as f64 / total.max(1) as f64
}

/// Text split and tokenized once, shared by every sub-statistic.
#[derive(Debug, Clone, Default)]
pub struct TextAnalysis {
    pub normalized: String,
    pub sentences: Vec<String>,
    pub words: Vec<String>,
    pub sentence_words: Vec<Vec<String>>,
}

impl TextAnalysis {
    pub fn new(text: &str) -> Self {
        let normalized = normalize_punctuation(text);
        let sentences = split_sentences(&normalized);
        let words = tokenize(&normalized);
        let sentence_words = sentences.iter().map(|s| tokenize(s)).collect();
        Self {
            normalized,
            sentences,
            words,
            sentence_words,
        }
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn sentence_count(&self) -> usize {
        self.sentences.len()
    }

    pub fn char_count(&self) -> usize {
        self.normalized.chars().count()
    }

    pub fn unique_words(&self) -> HashSet<&str> {
        self.words.iter().map(|w| w.as_str()).collect()
    }

    pub fn lowercase(&self) -> String {
        self.normalized.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_punctuation() {
        let input = "Hello\u{201c}World\u{201d}  \u{2014} ok\r\n  next ";
        let output = normalize_punctuation(input);
        assert_eq!(output, "Hello\"World\" - ok\nnext");
    }

    #[test]
    fn test_split_sentences_keeps_decimals() {
        let sentences = split_sentences("The value is 3.14 today. Tomorrow it rises again!");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("3.14"));
    }

    #[test]
    fn test_split_sentences_respects_quotes() {
        let sentences = split_sentences("He said \"stop. now\" and left quickly. Then silence fell.");
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn test_split_sentences_drops_fragments() {
        let sentences = split_sentences("Ok. This one is a real sentence.");
        assert_eq!(sentences, vec!["This one is a real sentence.".to_string()]);
    }

    #[test]
    fn test_tokenize_lowercases_and_keeps_contractions() {
        assert_eq!(tokenize("It's the END, 2 cats."), vec!["it's", "the", "end", "2", "cats"]);
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("plain english text"), "en");
        assert_eq!(detect_language("这是一段中文文本"), "zh");
    }

    #[test]
    fn test_ngram_repeat_rate() {
        let tokens: Vec<String> = "a b c a b c".split(' ').map(String::from).collect();
        // 4 trigrams, "a b c" occurs twice.
        assert!((ngram_repeat_rate(&tokens, 3) - 0.25).abs() < 1e-9);
        assert_eq!(ngram_repeat_rate(&tokens[..2], 3), 0.0);
    }

    #[test]
    fn test_text_analysis_shares_tokens() {
        let analysis = TextAnalysis::new("First sentence here. Second sentence there.");
        assert_eq!(analysis.sentence_count(), 2);
        assert_eq!(analysis.word_count(), 6);
        assert_eq!(analysis.sentence_words[1], vec!["second", "sentence", "there"]);
    }
}
