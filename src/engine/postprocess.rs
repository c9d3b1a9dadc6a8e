use regex::Regex;

use super::RawSegment;

/// Bracketed annotations whisper emits instead of speech.
const NON_SPEECH_MARKERS: &[&str] = &[
    "BLANK_AUDIO",
    "INAUDIBLE",
    "NO_SPEECH",
    "SILENCE",
    "MUSIC",
    "NOISE",
];

/// Drops segments that carry no speech: empty text, bracketed non-speech
/// markers, or a repeat of the initial prompt.
pub fn clean_segments(segments: Vec<RawSegment>, prompt: Option<&str>) -> Vec<RawSegment> {
    let echo = prompt.and_then(PromptEcho::new);

    segments
        .into_iter()
        .filter_map(|mut segment| {
            let text = segment.text.trim();
            if text.is_empty() || is_non_speech(text) {
                return None;
            }
            if echo.as_ref().is_some_and(|echo| echo.matches(text)) {
                return None;
            }
            segment.text = text.to_string();
            Some(segment)
        })
        .collect()
}

/// True when every word of `text` is a known marker such as `[BLANK_AUDIO]`
/// or `(music)`, ignoring trailing punctuation.
pub fn is_non_speech(text: &str) -> bool {
    let mut words = text
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| c.is_ascii_punctuation() && !"[]()".contains(c)))
        .filter(|word| !word.is_empty())
        .peekable();

    words.peek().is_some() && words.all(|word| marker_name(word).is_some_and(is_known_marker))
}

fn marker_name(word: &str) -> Option<&str> {
    let inner = word
        .strip_prefix('[')
        .and_then(|w| w.strip_suffix(']'))
        .or_else(|| word.strip_prefix('(').and_then(|w| w.strip_suffix(')')))?;
    Some(inner.trim()).filter(|name| !name.is_empty())
}

fn is_known_marker(name: &str) -> bool {
    let canonical: String = name
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    NON_SPEECH_MARKERS.contains(&canonical.as_str())
}

/// Recognises segments that only repeat the initial prompt, or one of its
/// sentences, which whisper tends to hallucinate over silence.
pub struct PromptEcho {
    patterns: Vec<Regex>,
}

impl PromptEcho {
    pub fn new(prompt: &str) -> Option<Self> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return None;
        }

        let sentences = prompt
            .split(['.', '!', '?'])
            .map(str::trim)
            .filter(|sentence| !sentence.is_empty());

        let patterns: Vec<Regex> = std::iter::once(prompt)
            .chain(sentences)
            .filter_map(|phrase| {
                Regex::new(&format!(
                    r#"(?i)^(?:{}[\s.!?"]*)+$"#,
                    regex::escape(phrase)
                ))
                .ok()
            })
            .collect();

        (!patterns.is_empty()).then_some(Self { patterns })
    }

    pub fn matches(&self, text: &str) -> bool {
        let text = text.trim();
        self.patterns.iter().any(|re| re.is_match(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(text: &str) -> RawSegment {
        RawSegment {
            start: 0.0,
            end: 1.0,
            text: text.to_string(),
            tokens: Vec::new(),
        }
    }

    #[test]
    fn detects_marker_only_text() {
        assert!(is_non_speech("[BLANK_AUDIO]"));
        assert!(is_non_speech("[Silence] (music)."));
        assert!(is_non_speech("[no_speech]"));
        assert!(!is_non_speech("[BLANK_AUDIO] hello"));
        assert!(!is_non_speech("[Applause]"));
        assert!(!is_non_speech("hello"));
        assert!(!is_non_speech("..."));
    }

    #[test]
    fn detects_prompt_echo() {
        let echo = PromptEcho::new("Meeting notes. Speakers discuss the budget.").unwrap();
        assert!(echo.matches("Meeting notes."));
        assert!(echo.matches("meeting notes meeting notes"));
        assert!(!echo.matches("The budget is approved."));
        assert!(PromptEcho::new("  ").is_none());
    }

    #[test]
    fn clean_segments_keeps_speech_only() {
        let cleaned = clean_segments(
            vec![
                segment(" [BLANK_AUDIO]"),
                segment(" Hello there. "),
                segment("   "),
                segment(" Weekly sync."),
            ],
            Some("Weekly sync."),
        );
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].text, "Hello there.");
    }
}
