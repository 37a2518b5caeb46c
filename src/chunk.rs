//! Deterministic text chunker for embedding calls.
//!
//! Splits normalized message text into slices that fit the embedding
//! provider's input budget. Splitting prefers sentence boundaries, falls
//! back to word boundaries, and hard-splits only when a single unbroken run
//! exceeds the budget. Consecutive chunks overlap by a fixed number of
//! characters so no sentence is stranded at a cut point.
//!
//! Chunking is pure: the same input always yields the same chunks, and the
//! concatenation of chunks (dropping each chunk's leading overlap) exactly
//! reconstructs the input.

/// Split `text` into chunks of at most `budget` characters with `overlap`
/// characters repeated between consecutive chunks.
///
/// Input at or under the budget yields exactly one chunk. `overlap` must be
/// smaller than `budget`; config validation enforces this.
pub fn chunk_text(text: &str, budget: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= budget {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let window_end = (start + budget).min(chars.len());
        let end = if window_end == chars.len() {
            window_end
        } else {
            split_point(&chars, start, window_end)
        };

        chunks.push(chars[start..end].iter().collect());

        if end >= chars.len() {
            break;
        }
        // Overlap backs the next chunk up into the tail of this one. Guard
        // against a degenerate split where overlap would not advance.
        start = if end > start + overlap { end - overlap } else { end };
    }

    chunks
}

/// Pick the split position inside `[start, window_end)`: the last sentence
/// boundary, else the last space, else the hard window end.
fn split_point(chars: &[char], start: usize, window_end: usize) -> usize {
    // Don't split in the first half of the window; a boundary that early
    // produces tiny chunks from punctuation-dense text.
    let floor = start + (window_end - start) / 2;

    let mut last_sentence = None;
    let mut last_space = None;
    for i in (floor..window_end).rev() {
        let ch = chars[i];
        if ch == '\n' {
            last_sentence.get_or_insert(i + 1);
        }
        if matches!(ch, '.' | '!' | '?')
            && chars.get(i + 1).map(|c| c.is_whitespace()).unwrap_or(false)
        {
            last_sentence.get_or_insert(i + 2);
        }
        if ch == ' ' && last_space.is_none() {
            last_space = Some(i + 1);
        }
        if last_sentence.is_some() {
            break;
        }
    }

    let valid = |pos: &usize| *pos > start && *pos <= window_end;
    last_sentence
        .filter(valid)
        .or(last_space.filter(valid))
        .unwrap_or(window_end)
}
