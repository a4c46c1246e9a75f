//! Text chunking for the embedding pipeline.
//!
//! Split order: paragraphs, then sentences inside oversized paragraphs,
//! then hard character cuts for pathological sentences. Consecutive
//! chunks overlap so retrieval does not lose context at boundaries; the
//! overlap is clamped to a third of the chunk budget.

pub const DEFAULT_MAX_CHARS: usize = 1500;
pub const DEFAULT_OVERLAP_CHARS: usize = 150;

/// Sentence terminators, including CJK full-width forms.
const SENTENCE_ENDS: &[char] = &['.', '!', '?', '\u{3002}', '\u{ff01}', '\u{ff1f}'];

/// Chunk with the default budget.
pub fn chunk_text(text: &str) -> Vec<String> {
    chunk_text_with(text, DEFAULT_MAX_CHARS, DEFAULT_OVERLAP_CHARS)
}

pub fn chunk_text_with(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let overlap_chars = overlap_chars.min(max_chars / 3);

    // Step 1: non-overlapping segments along paragraph/sentence bounds.
    let mut segments: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        if char_len(&current) + char_len(para) + 2 <= max_chars {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
            continue;
        }

        if !current.is_empty() {
            segments.push(std::mem::take(&mut current));
        }

        if char_len(para) <= max_chars {
            current = para.to_string();
            continue;
        }

        // Oversized paragraph: sentence pass, then hard cuts.
        for sentence in split_sentences(para) {
            if char_len(&current) + char_len(&sentence) + 1 <= max_chars {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(&sentence);
            } else {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                if char_len(&sentence) > max_chars {
                    for piece in hard_cut(&sentence, max_chars) {
                        segments.push(piece);
                    }
                } else {
                    current = sentence;
                }
            }
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    if segments.is_empty() {
        return Vec::new();
    }

    // Step 2: stitch overlapping chunks, each within the budget.
    let mut chunks: Vec<String> = vec![segments[0].clone()];
    for segment in segments.iter().skip(1) {
        let prev_tail = char_tail(chunks.last().expect("non-empty"), overlap_chars);
        let candidate = format!("{} {}", prev_tail, segment);
        if char_len(&candidate) <= max_chars {
            chunks.push(candidate);
        } else {
            // Trim the overlap so the segment still fits.
            let available = max_chars.saturating_sub(char_len(segment) + 1);
            if available > 0 {
                let tail = char_tail(chunks.last().expect("non-empty"), available);
                chunks.push(format!("{} {}", tail, segment));
            } else {
                chunks.push(char_head(segment, max_chars));
            }
        }
    }

    chunks
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn char_tail(s: &str, n: usize) -> String {
    let total = char_len(s);
    if total <= n {
        return s.to_string();
    }
    s.chars().skip(total - n).collect()
}

fn char_head(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn hard_cut(s: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}

/// Split on sentence terminators, keeping the terminator with the
/// sentence. Handles mixed CJK/Latin text: full-width terminators end a
/// sentence without requiring trailing whitespace.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if SENTENCE_ENDS.contains(&c) {
            let next_is_space = chars.peek().map_or(true, |n| n.is_whitespace());
            let is_cjk_end = !c.is_ascii();
            if is_cjk_end || next_is_space {
                let trimmed = current.trim().to_string();
                if !trimmed.is_empty() {
                    sentences.push(trimmed);
                }
                current.clear();
            }
        }
    }
    let trimmed = current.trim().to_string();
    if !trimmed.is_empty() {
        sentences.push(trimmed);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_short_inputs() {
        assert!(chunk_text("").is_empty());
        assert_eq!(chunk_text("short text"), vec!["short text"]);
    }

    #[test]
    fn test_chunks_respect_budget() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {} with a reasonable amount of text in it.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text_with(&text, 300, 50);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 300, "chunk too long: {}", chunk.len());
        }
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let text = (0..20)
            .map(|i| format!("Sentence block {} stretches out to fill space here.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text_with(&text, 200, 60);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(20).collect::<String>()
                .chars().rev().collect();
            assert!(
                pair[1].contains(tail.trim()),
                "no overlap between consecutive chunks"
            );
        }
    }

    #[test]
    fn test_overlap_clamped_to_third() {
        // overlap 500 with max 300 must clamp to 100, not overflow.
        let text = (0..20)
            .map(|i| format!("Filler paragraph number {} with plenty of words inside.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text_with(&text, 300, 500);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 300);
        }
    }

    #[test]
    fn test_oversized_sentence_hard_cut() {
        let text = format!("{}\n\nnext paragraph", "x".repeat(5000));
        let chunks = chunk_text_with(&text, 1000, 100);
        assert!(chunks.iter().all(|c| c.chars().count() <= 1000));
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(total >= 5000);
    }

    #[test]
    fn test_cjk_sentences_split() {
        let para = "今日市场大幅上涨。成交量创下新高！分析师预计趋势延续？尾部说明".repeat(40);
        let chunks = chunk_text_with(&para, 400, 50);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 400));
    }

    #[test]
    fn test_split_sentences_mixed() {
        let sentences = split_sentences("First sentence. Second one! 中文句子。Third?");
        assert_eq!(sentences.len(), 4);
        assert_eq!(sentences[0], "First sentence.");
        assert_eq!(sentences[2], "中文句子。");
    }

    #[test]
    fn test_decimal_points_do_not_split() {
        let sentences = split_sentences("Revenue grew 4.2 percent. Margins held.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("4.2"));
    }
}
