//! Stop-sequence matching over streamed pieces

/// Role-turn delimiters and end-of-text markers of the common chat formats
pub const DEFAULT_STOP_SEQUENCES: &[&str] = &[
    "<|im_end|>",
    "<|im_start|>",
    "<|end|>",
    "<|eot_id|>",
    "<|endoftext|>",
    "</s>",
    "<end_of_turn>",
];

/// Literal strings that end a generation when they appear in the output.
///
/// A stop string is detected when the accumulated text ends with it, or when
/// the latest piece contains it. A stop string spread over more than two pieces
/// that does not end exactly on a piece boundary goes undetected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSequences {
    sequences: Vec<String>,
}

impl StopSequences {
    pub fn new<S: AsRef<str>>(sequences: &[S]) -> Self {
        Self {
            sequences: sequences
                .iter()
                .map(|s| s.as_ref().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// First stop string matched by `accumulated` after `piece` was appended to it
    pub fn find_match(&self, accumulated: &str, piece: &str) -> Option<&str> {
        self.sequences
            .iter()
            .find(|s| accumulated.ends_with(s.as_str()) || piece.contains(s.as_str()))
            .map(String::as_str)
    }

    /// Cut `text` at the last occurrence of `matched`
    pub fn truncate_at(text: &mut String, matched: &str) {
        if let Some(idx) = text.rfind(matched) {
            text.truncate(idx);
        }
    }
}

impl Default for StopSequences {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_SEQUENCES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_match_across_pieces() {
        let stops = StopSequences::default();
        let mut text = String::from("Hello<|im_");
        assert_eq!(stops.find_match(&text, "<|im_"), None);
        text.push_str("end|>");
        assert_eq!(stops.find_match(&text, "end|>"), Some("<|im_end|>"));
    }

    #[test]
    fn test_piece_contains_match() {
        let stops = StopSequences::new(&["###"]);
        let text = "answer ### trailing";
        assert_eq!(stops.find_match(text, " ### trailing"), Some("###"));
    }

    #[test]
    fn test_span_over_three_pieces_not_ending_on_boundary() {
        let stops = StopSequences::new(&["STOP"]);
        // "ST" + "O" + "Px" never has STOP at the tail nor inside one piece
        assert_eq!(stops.find_match("ST", "ST"), None);
        assert_eq!(stops.find_match("STO", "O"), None);
        assert_eq!(stops.find_match("STOPx", "Px"), None);
    }

    #[test]
    fn test_truncate_at_last_occurrence() {
        let mut text = String::from("a</s>b</s>");
        StopSequences::truncate_at(&mut text, "</s>");
        assert_eq!(text, "a</s>b");
    }

    #[test]
    fn test_empty_strings_dropped() {
        assert!(StopSequences::new(&[""]).is_empty());
    }
}
