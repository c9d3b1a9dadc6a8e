//! Turns engine output into ordered segments with optional word timings.

use crate::engine::{RawSegment, RawToken};
use crate::transcript::{Segment, Word};

/// Builds output segments from cleaned engine segments.
///
/// Segment starts never decrease across the list and every segment ends at
/// or after its start. When `with_words` is set, token timings are merged
/// into words, clamped into the segment window, and the segment bounds snap
/// to the first and last word. `duration` (seconds, `<= 0` when unknown)
/// caps all timestamps.
pub fn align_segments(raw: Vec<RawSegment>, with_words: bool, duration: f64) -> Vec<Segment> {
    let cap = |t: f64| if duration > 0.0 { t.min(duration) } else { t };
    let mut floor = 0.0_f64;

    raw.into_iter()
        .enumerate()
        .map(|(id, segment)| {
            let mut start = cap(segment.start.max(floor));
            let mut end = cap(segment.end).max(start);

            let words = if with_words {
                let mut words = words_from_tokens(&segment.tokens);
                clamp_words(&mut words, start, end);
                if let (Some(first), Some(last)) = (words.first(), words.last()) {
                    start = first.start;
                    end = last.end.max(start);
                }
                (!words.is_empty()).then_some(words)
            } else {
                None
            };

            floor = start;

            Segment {
                id,
                start,
                end,
                text: segment.text,
                speaker: None,
                words,
            }
        })
        .collect()
}

/// Merges sub-word tokens into words. A token with a leading space opens a new
/// word; anything else (continuations, punctuation) extends the current one.
pub fn words_from_tokens(tokens: &[RawToken]) -> Vec<Word> {
    struct Pending {
        text: String,
        start: f64,
        end: f64,
        prob_sum: f32,
        count: u32,
    }

    impl Pending {
        fn finish(self) -> Option<Word> {
            let text = self.text.trim();
            if text.is_empty() {
                return None;
            }
            Some(Word {
                word: text.to_string(),
                start: self.start,
                end: self.end.max(self.start),
                probability: self.prob_sum / self.count.max(1) as f32,
                speaker: None,
            })
        }
    }

    let mut words = Vec::new();
    let mut current: Option<Pending> = None;

    for token in tokens {
        let opens_word = token.text.starts_with(' ') || current.is_none();
        if opens_word {
            if let Some(done) = current.take().and_then(Pending::finish) {
                words.push(done);
            }
            current = Some(Pending {
                text: token.text.clone(),
                start: token.start,
                end: token.end,
                prob_sum: token.probability,
                count: 1,
            });
        } else if let Some(pending) = current.as_mut() {
            pending.text.push_str(&token.text);
            pending.end = pending.end.max(token.end);
            pending.prob_sum += token.probability;
            pending.count += 1;
        }
    }

    if let Some(done) = current.and_then(Pending::finish) {
        words.push(done);
    }

    words
}

fn clamp_words(words: &mut [Word], start: f64, end: f64) {
    let mut floor = start;
    for word in words.iter_mut() {
        word.start = word.start.clamp(floor, end);
        word.end = word.end.clamp(word.start, end);
        floor = word.start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str, start: f64, end: f64, p: f32) -> RawToken {
        RawToken {
            text: text.to_string(),
            start,
            end,
            probability: p,
        }
    }

    fn raw(start: f64, end: f64, text: &str, tokens: Vec<RawToken>) -> RawSegment {
        RawSegment {
            start,
            end,
            text: text.to_string(),
            tokens,
        }
    }

    #[test]
    fn merges_subword_tokens() {
        let words = words_from_tokens(&[
            token(" Trans", 0.0, 0.2, 0.8),
            token("cription", 0.2, 0.6, 0.6),
            token(" works", 0.6, 1.0, 0.9),
            token(".", 1.0, 1.1, 1.0),
        ]);

        assert_eq!(words.len(), 2);
        assert_eq!(words[0].word, "Transcription");
        assert_eq!(words[0].end, 0.6);
        assert!((words[0].probability - 0.7).abs() < 1e-6);
        assert_eq!(words[1].word, "works.");
        assert_eq!(words[1].end, 1.1);
    }

    #[test]
    fn segment_starts_never_decrease() {
        let segments = align_segments(
            vec![
                raw(0.0, 2.0, "one", vec![]),
                raw(1.5, 3.0, "two", vec![]),
                raw(1.0, 0.5, "three", vec![]),
            ],
            false,
            10.0,
        );

        let starts: Vec<f64> = segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0.0, 1.5, 1.5]);
        assert!(segments.iter().all(|s| s.end >= s.start));
        assert!(segments.iter().all(|s| s.words.is_none()));
        assert_eq!(segments[2].id, 2);
    }

    #[test]
    fn words_snap_segment_bounds_and_stay_inside() {
        let segments = align_segments(
            vec![raw(
                0.0,
                3.0,
                "Hello world",
                vec![token(" Hello", 0.4, 0.9, 0.9), token(" world", 0.2, 3.6, 0.8)],
            )],
            true,
            3.2,
        );

        let segment = &segments[0];
        let words = segment.words.as_ref().unwrap();
        assert_eq!(segment.start, 0.4);
        assert_eq!(words[1].start, 0.4);
        assert_eq!(words[1].end, 3.0);
        assert_eq!(segment.end, 3.0);
    }

    #[test]
    fn caps_to_audio_duration() {
        let segments = align_segments(vec![raw(0.0, 5.0, "long", vec![])], false, 4.2);
        assert_eq!(segments[0].end, 4.2);
    }
}
