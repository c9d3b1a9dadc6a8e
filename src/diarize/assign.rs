use std::collections::HashMap;

use super::SpeakerTurn;
use crate::transcript::Segment;

/// Labels every segment and word with the speaker whose turns overlap it the
/// most. Spans with no overlapping turn keep `speaker: None`.
pub fn assign_speakers(segments: &mut [Segment], turns: &[SpeakerTurn]) {
    if turns.is_empty() {
        return;
    }

    for segment in segments.iter_mut() {
        segment.speaker = dominant_speaker(segment.start, segment.end, turns);
        for word in segment.words.iter_mut().flatten() {
            word.speaker = dominant_speaker(word.start, word.end, turns);
        }
    }
}

fn dominant_speaker(start: f64, end: f64, turns: &[SpeakerTurn]) -> Option<String> {
    let mut totals: HashMap<&str, f64> = HashMap::new();

    for turn in turns {
        let overlap = end.min(turn.end) - start.max(turn.start);
        if overlap > 0.0 {
            *totals.entry(turn.speaker.as_str()).or_default() += overlap;
        }
    }

    totals
        .into_iter()
        // Ties go to the lexically smaller label so results are deterministic.
        .max_by(|(a_name, a), (b_name, b)| a.total_cmp(b).then_with(|| b_name.cmp(a_name)))
        .map(|(speaker, _)| speaker.to_string())
}
