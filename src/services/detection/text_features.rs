// Text Feature Extraction
// Closed-form stylometric statistics over a text sample, each normalized to [0, 1]
// where higher reads as more machine-like.

use crate::models::FeatureVector;
use crate::services::text_processor::{ngram_repeat_rate, TextAnalysis};
use std::collections::{HashMap, HashSet};

use super::stats::{clamp01, mean, shannon_entropy, std_dev, variance};

/// Texts shorter than this (after trimming) produce an empty vector.
pub const MIN_TEXT_CHARS: usize = 20;

/// Neutral value for statistics that lack enough material to say anything.
const NEUTRAL: f64 = 0.5;
const MIN_WORDS: usize = 10;
const MIN_SENTENCES: usize = 3;

pub const CHAR_ENTROPY: &str = "char_entropy";
pub const SENTENCE_UNIFORMITY: &str = "sentence_uniformity";
pub const STOPWORD_DENSITY: &str = "stopword_density";
pub const LIST_DENSITY: &str = "list_density";
pub const HEDGING: &str = "hedging";
pub const BURSTINESS: &str = "burstiness";
pub const LEXICAL_DIVERSITY: &str = "lexical_diversity";
pub const NGRAM_REPETITION: &str = "ngram_repetition";
pub const WORD_ENTROPY: &str = "word_entropy";
pub const PUNCTUATION_DIVERSITY: &str = "punctuation_diversity";
pub const DISCOURSE_MARKERS: &str = "discourse_markers";
pub const PRONOUN_PERSON: &str = "pronoun_person";
pub const WORD_LENGTH_UNIFORMITY: &str = "word_length_uniformity";
pub const COMMON_WORD_RATIO: &str = "common_word_ratio";
pub const COHERENCE: &str = "coherence";
pub const SENTENCE_FREQUENCY_UNIFORMITY: &str = "sentence_frequency_uniformity";
pub const SYNTACTIC_UNIFORMITY: &str = "syntactic_uniformity";
pub const TRANSITION_SMOOTHNESS: &str = "transition_smoothness";

const STOPWORDS: &[&str] = &[
    "the", "is", "at", "which", "on", "and", "a", "an", "to", "of", "in", "for", "with",
];

const HEDGING_PHRASES: &[&str] = &[
    "it is important to note",
    "in conclusion",
    "generally speaking",
    "overall",
    "as mentioned earlier",
];

const COMMON_WORDS: &[&str] = &[
    "the", "be", "to", "of", "and", "a", "in", "that", "have", "i", "it", "for", "not", "on",
    "with", "he", "as", "you", "do", "at", "this", "but", "his", "by", "from", "they", "we",
    "say", "her", "she", "or", "an", "will", "my", "one", "all", "would", "there", "their",
    "what", "so", "up", "out", "if", "about", "who", "get", "which", "go", "me", "when",
    "make", "can", "like", "time", "no", "just", "him", "know", "take", "people", "into",
    "year", "your", "good", "some", "could", "them", "see", "other", "than", "then", "now",
    "look", "only", "come", "its", "over", "think", "also", "back", "after", "use", "two",
    "how", "our", "work", "first", "well", "way", "even", "new", "want", "because", "any",
    "these", "give", "day", "most", "us",
];

const DISCOURSE_MARKER_WORDS: &[&str] = &[
    "however", "therefore", "moreover", "furthermore", "nevertheless", "consequently",
    "additionally", "meanwhile", "thus", "hence", "indeed", "specifically", "generally",
    "particularly", "especially", "notably", "importantly", "interestingly", "surprisingly",
    "obviously", "clearly", "essentially", "basically", "ultimately", "finally", "initially",
    "subsequently", "previously", "currently", "recently", "traditionally", "typically",
    "usually", "often", "sometimes", "rarely", "never", "always",
];

const CLAUSE_WORDS: &[&str] = &["and", "but", "or", "because", "although", "while", "if", "when"];

const FIRST_PERSON: &[&str] = &["i", "me", "my", "mine", "myself", "we", "us", "our", "ours", "ourselves"];
const SECOND_PERSON: &[&str] = &["you", "your", "yours", "yourself", "yourselves"];
const THIRD_PERSON: &[&str] = &[
    "he", "she", "it", "him", "her", "his", "hers", "its", "they", "them", "their", "theirs",
    "themselves",
];

/// Cheap statistics used for the synchronous quick score.
pub fn extract_quick(text: &str) -> FeatureVector {
    if text.trim().chars().count() < MIN_TEXT_CHARS {
        return FeatureVector::new();
    }
    extract_quick_from(&TextAnalysis::new(text))
}

/// Full statistic set used during refinement.
pub fn extract_refined(text: &str) -> FeatureVector {
    if text.trim().chars().count() < MIN_TEXT_CHARS {
        return FeatureVector::new();
    }
    extract_refined_from(&TextAnalysis::new(text))
}

pub fn extract_quick_from(analysis: &TextAnalysis) -> FeatureVector {
    let mut fv = FeatureVector::new();
    fv.insert(CHAR_ENTROPY, char_entropy(analysis));
    fv.insert(SENTENCE_UNIFORMITY, sentence_uniformity(analysis));
    fv.insert(STOPWORD_DENSITY, stopword_density(analysis));
    fv.insert(LIST_DENSITY, list_density(analysis));
    fv.insert(HEDGING, hedging(analysis));
    fv
}

pub fn extract_refined_from(analysis: &TextAnalysis) -> FeatureVector {
    let mut fv = extract_quick_from(analysis);
    fv.insert(BURSTINESS, burstiness(analysis));
    fv.insert(LEXICAL_DIVERSITY, lexical_diversity(analysis));
    fv.insert(NGRAM_REPETITION, ngram_repetition(analysis));
    fv.insert(WORD_ENTROPY, word_entropy(analysis));
    fv.insert(PUNCTUATION_DIVERSITY, punctuation_diversity(analysis));
    fv.insert(DISCOURSE_MARKERS, discourse_markers(analysis));
    fv.insert(PRONOUN_PERSON, pronoun_person(analysis));
    fv.insert(WORD_LENGTH_UNIFORMITY, word_length_uniformity(analysis));
    fv.insert(COMMON_WORD_RATIO, common_word_ratio(analysis));
    fv.insert(COHERENCE, coherence(analysis));
    fv.insert(SENTENCE_FREQUENCY_UNIFORMITY, sentence_frequency_uniformity(analysis));
    fv.insert(SYNTACTIC_UNIFORMITY, syntactic_uniformity(analysis));
    fv.insert(TRANSITION_SMOOTHNESS, transition_smoothness(analysis));
    fv
}

// ============ Quick statistics ============

/// Shannon entropy of the character distribution, inverted against 5 bits.
pub fn char_entropy(a: &TextAnalysis) -> f64 {
    let mut freq: HashMap<char, usize> = HashMap::new();
    for ch in a.normalized.chars() {
        *freq.entry(ch).or_insert(0) += 1;
    }
    if freq.is_empty() {
        return NEUTRAL;
    }
    clamp01(1.0 - shannon_entropy(freq.into_values()) / 5.0)
}

/// Variance of words-per-sentence, inverted. Uniform lengths score high.
pub fn sentence_uniformity(a: &TextAnalysis) -> f64 {
    if a.sentence_count() < MIN_SENTENCES {
        return NEUTRAL;
    }
    let lengths = sentence_lengths(a);
    clamp01(1.0 - variance(&lengths) / 50.0)
}

pub fn stopword_density(a: &TextAnalysis) -> f64 {
    if a.words.is_empty() {
        return NEUTRAL;
    }
    let stop: HashSet<&str> = STOPWORDS.iter().copied().collect();
    let count = a.words.iter().filter(|w| stop.contains(w.as_str())).count();
    clamp01(count as f64 / a.word_count() as f64 * 2.0)
}

/// Bullet-style list lines, five or more saturate.
pub fn list_density(a: &TextAnalysis) -> f64 {
    let glyphs = a.normalized.chars().filter(|c| matches!(c, '•' | '◦' | '▪')).count();
    let dashed = a
        .normalized
        .lines()
        .filter(|ln| {
            let t = ln.trim_start();
            t.starts_with("- ") || t.starts_with("* ") || t.starts_with("+ ")
        })
        .count();
    clamp01((glyphs + dashed) as f64 / 5.0)
}

/// Fixed hedging phrases, two or more distinct hits saturate.
pub fn hedging(a: &TextAnalysis) -> f64 {
    let lower = a.lowercase();
    let hits = HEDGING_PHRASES.iter().filter(|p| lower.contains(*p)).count();
    clamp01(hits as f64 / 2.0)
}

// ============ Refined statistics ============

/// Coefficient of variation of sentence lengths, inverted.
pub fn burstiness(a: &TextAnalysis) -> f64 {
    if a.sentence_count() < MIN_SENTENCES {
        return NEUTRAL;
    }
    let lengths = sentence_lengths(a);
    let m = mean(&lengths);
    if m == 0.0 {
        return NEUTRAL;
    }
    clamp01(1.0 - (std_dev(&lengths) / m) / 2.0)
}

/// Type/token ratio, inverted. Repetitive vocabulary scores high.
pub fn lexical_diversity(a: &TextAnalysis) -> f64 {
    if a.word_count() < MIN_WORDS {
        return NEUTRAL;
    }
    let ttr = a.unique_words().len() as f64 / a.word_count() as f64;
    clamp01(1.0 - ttr * 2.0)
}

/// Fraction of repeated word 3-grams, doubled.
pub fn ngram_repetition(a: &TextAnalysis) -> f64 {
    if a.word_count() < MIN_WORDS {
        return NEUTRAL;
    }
    clamp01(ngram_repeat_rate(&a.words, 3) * 2.0)
}

/// Word-frequency entropy normalized by the vocabulary size, inverted.
pub fn word_entropy(a: &TextAnalysis) -> f64 {
    if a.word_count() < MIN_WORDS {
        return NEUTRAL;
    }
    let mut freq: HashMap<&str, usize> = HashMap::new();
    for w in &a.words {
        *freq.entry(w.as_str()).or_insert(0) += 1;
    }
    let vocab = freq.len();
    if vocab <= 1 {
        return 1.0;
    }
    let max_entropy = (vocab as f64).log2();
    clamp01(1.0 - shannon_entropy(freq.into_values()) / max_entropy)
}

pub fn punctuation_diversity(a: &TextAnalysis) -> f64 {
    let marks: Vec<char> = a
        .normalized
        .chars()
        .filter(|c| matches!(c, '.' | ',' | '!' | '?' | ';' | ':' | '-'))
        .collect();
    if marks.len() < 5 {
        return NEUTRAL;
    }
    let unique: HashSet<char> = marks.iter().copied().collect();
    clamp01(1.0 - unique.len() as f64 / marks.len().min(10) as f64)
}

/// Reuse of the same discourse markers, measured over marker occurrences.
pub fn discourse_markers(a: &TextAnalysis) -> f64 {
    let markers: HashSet<&str> = DISCOURSE_MARKER_WORDS.iter().copied().collect();
    let found: Vec<&str> = a
        .words
        .iter()
        .map(|w| w.as_str())
        .filter(|w| markers.contains(w))
        .collect();
    if found.len() < 2 {
        return NEUTRAL;
    }
    let unique: HashSet<&str> = found.iter().copied().collect();
    clamp01(1.0 - unique.len() as f64 / found.len().min(10) as f64)
}

/// Share of third-person pronouns among all personal pronouns.
pub fn pronoun_person(a: &TextAnalysis) -> f64 {
    let count_in = |set: &[&str]| a.words.iter().filter(|w| set.contains(&w.as_str())).count();
    let first = count_in(FIRST_PERSON);
    let second = count_in(SECOND_PERSON);
    let third = count_in(THIRD_PERSON);
    let total = first + second + third;
    if total < 3 {
        return NEUTRAL;
    }
    clamp01(third as f64 / total as f64 * 1.3)
}

pub fn word_length_uniformity(a: &TextAnalysis) -> f64 {
    if a.word_count() < MIN_WORDS {
        return NEUTRAL;
    }
    let lengths: Vec<f64> = a.words.iter().map(|w| w.chars().count() as f64).collect();
    clamp01(1.0 - variance(&lengths) / 5.0)
}

/// Cross-entropy proxy: share of content words drawn from a small common-word list.
pub fn common_word_ratio(a: &TextAnalysis) -> f64 {
    let words: Vec<&str> = a
        .words
        .iter()
        .map(|w| w.as_str())
        .filter(|w| w.chars().count() > 2)
        .collect();
    if words.len() < MIN_WORDS {
        return NEUTRAL;
    }
    let common: HashSet<&str> = COMMON_WORDS.iter().copied().collect();
    let hits = words.iter().filter(|w| common.contains(*w)).count();
    clamp01(hits as f64 / words.len() as f64 * 1.5)
}

/// Mean Jaccard overlap of content words between adjacent sentences, doubled.
pub fn coherence(a: &TextAnalysis) -> f64 {
    if a.sentence_count() < 2 {
        return NEUTRAL;
    }
    let sets: Vec<HashSet<&str>> = a
        .sentence_words
        .iter()
        .map(|ws| ws.iter().map(|w| w.as_str()).filter(|w| w.chars().count() > 2).collect())
        .collect();
    let overlaps: Vec<f64> = sets
        .windows(2)
        .map(|pair| {
            let inter = pair[0].intersection(&pair[1]).count();
            let union = pair[0].len() + pair[1].len() - inter;
            if union == 0 {
                0.0
            } else {
                inter as f64 / union as f64
            }
        })
        .collect();
    clamp01(mean(&overlaps) * 2.0)
}

/// Spread of per-sentence mean word frequency, inverted. Scale-free (coefficient of variation).
pub fn sentence_frequency_uniformity(a: &TextAnalysis) -> f64 {
    if a.sentence_count() < MIN_SENTENCES || a.word_count() == 0 {
        return NEUTRAL;
    }
    let mut freq: HashMap<&str, usize> = HashMap::new();
    for w in a.words.iter().filter(|w| w.chars().count() > 2) {
        *freq.entry(w.as_str()).or_insert(0) += 1;
    }
    let total = a.word_count() as f64;
    let per_sentence: Vec<f64> = a
        .sentence_words
        .iter()
        .filter_map(|ws| {
            let content: Vec<f64> = ws
                .iter()
                .filter(|w| w.chars().count() > 2)
                .map(|w| freq.get(w.as_str()).copied().unwrap_or(0) as f64 / total)
                .collect();
            if content.is_empty() {
                None
            } else {
                Some(mean(&content))
            }
        })
        .collect();
    if per_sentence.len() < MIN_SENTENCES {
        return NEUTRAL;
    }
    let m = mean(&per_sentence);
    if m == 0.0 {
        return NEUTRAL;
    }
    clamp01(1.0 - std_dev(&per_sentence) / m)
}

/// Variance of clause-marker density per sentence, inverted.
pub fn syntactic_uniformity(a: &TextAnalysis) -> f64 {
    if a.sentence_count() < MIN_SENTENCES {
        return NEUTRAL;
    }
    let densities: Vec<f64> = a
        .sentences
        .iter()
        .zip(a.sentence_words.iter())
        .map(|(sentence, words)| {
            if words.is_empty() {
                return 0.0;
            }
            let commas = sentence.matches(',').count();
            let joins = words.iter().filter(|w| CLAUSE_WORDS.contains(&w.as_str())).count();
            (commas + joins) as f64 / words.len() as f64
        })
        .collect();
    clamp01(1.0 - variance(&densities) * 20.0)
}

/// Mean bigram transition probability P(w2 | w1), doubled.
pub fn transition_smoothness(a: &TextAnalysis) -> f64 {
    if a.word_count() < 20 {
        return NEUTRAL;
    }
    let mut unigrams: HashMap<&str, usize> = HashMap::new();
    for w in &a.words {
        *unigrams.entry(w.as_str()).or_insert(0) += 1;
    }
    let mut bigrams: HashMap<(&str, &str), usize> = HashMap::new();
    for pair in a.words.windows(2) {
        *bigrams.entry((pair[0].as_str(), pair[1].as_str())).or_insert(0) += 1;
    }
    let probs: Vec<f64> = bigrams
        .iter()
        .map(|((w1, _), count)| *count as f64 / unigrams.get(w1).copied().unwrap_or(1).max(1) as f64)
        .collect();
    clamp01(mean(&probs) * 2.0)
}

fn sentence_lengths(a: &TextAnalysis) -> Vec<f64> {
    a.sentence_words.iter().map(|ws| ws.len() as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIFORM: &str = "The cat sat on the mat in the sun. The dog sat on the rug in the hall. \
        The bird sat on the branch in the tree. The fish swam in the bowl on the desk. \
        The cow stood in the field on the farm.";

    const VARIED: &str = "Honestly? I never expected my grandmother's tomato plants to survive that brutal \
        August heatwave, but somehow they did. We laughed. Later, after dinner, she told me stories \
        about her village, the river, a goat named Pepper who ate her shoes; I still can't tell which \
        parts were true!";

    #[test]
    fn test_short_text_yields_empty_vector() {
        assert!(extract_quick("too short").is_empty());
        assert!(extract_refined("   tiny text here   ").is_empty());
    }

    #[test]
    fn test_all_features_in_range() {
        for text in [UNIFORM, VARIED] {
            let fv = extract_refined(text);
            assert_eq!(fv.len(), 18);
            for (name, value) in fv.iter() {
                assert!((0.0..=1.0).contains(&value), "{} out of range: {}", name, value);
            }
        }
    }

    #[test]
    fn test_neutral_defaults_on_tiny_input() {
        let a = TextAnalysis::new("Just one short sentence with words.");
        assert_eq!(burstiness(&a), NEUTRAL);
        assert_eq!(sentence_uniformity(&a), NEUTRAL);
        assert_eq!(lexical_diversity(&a), NEUTRAL);
        assert_eq!(transition_smoothness(&a), NEUTRAL);
        assert_eq!(coherence(&a), NEUTRAL);
        assert_eq!(punctuation_diversity(&a), NEUTRAL);
        assert_eq!(discourse_markers(&a), NEUTRAL);
    }

    #[test]
    fn test_uniform_sentences_score_higher_than_varied() {
        let u = TextAnalysis::new(UNIFORM);
        let v = TextAnalysis::new(VARIED);
        assert!(sentence_uniformity(&u) > sentence_uniformity(&v));
        assert!(burstiness(&u) > burstiness(&v));
        assert!(stopword_density(&u) > stopword_density(&v));
    }

    #[test]
    fn test_hedging_and_lists() {
        let a = TextAnalysis::new(
            "Overall, the plan works. In conclusion, we proceed.\n- first item\n- second item",
        );
        assert_eq!(hedging(&a), 1.0);
        assert!((list_density(&a) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        assert_eq!(extract_refined(VARIED), extract_refined(VARIED));
    }
}
