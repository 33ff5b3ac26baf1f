//! Sentence segmentation for streaming text.
//!
//! [`split_sentences`] is called on the accumulated, not yet segmented text
//! every time a new chunk arrives. It returns the sentences whose terminator
//! has been seen and leaves the unterminated tail as the remainder, which the
//! caller keeps and prepends to the next chunk.

/// Result of one segmentation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segmented {
    /// Completed sentences, in order, trimmed. Fragments made only of
    /// terminators and closers are dropped.
    pub sentences: Vec<String>,
    /// Text after the last completed sentence. Not trimmed.
    pub remainder: String,
}

fn is_ascii_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ';' | '…')
}

fn is_wide_terminator(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '；')
}

fn is_closer(c: char) -> bool {
    matches!(
        c,
        '"' | '\'' | ')' | ']' | '}' | '”' | '’' | '」' | '』' | '）' | '》'
    )
}

fn has_content(c: char) -> bool {
    !c.is_whitespace() && !is_ascii_terminator(c) && !is_wide_terminator(c) && !is_closer(c)
}

/// Splits `text` into completed sentences and an unterminated remainder.
///
/// A run of terminators plus any closing quotes or brackets belongs to the
/// sentence it ends. ASCII terminators only end a sentence when followed by
/// whitespace or the end of the text; full-width terminators end it at once.
/// A `.` at the very end of the text right after a digit is held back since
/// the rest of a decimal number may still be in flight.
pub fn split_sentences(text: &str) -> Segmented {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let (_, c) = chars[i];
        let wide = is_wide_terminator(c);
        if !wide && !is_ascii_terminator(c) {
            i += 1;
            continue;
        }

        let run_start = i;
        let mut j = i + 1;
        let mut run_has_wide = wide;
        while j < chars.len() && (is_ascii_terminator(chars[j].1) || is_wide_terminator(chars[j].1))
        {
            run_has_wide |= is_wide_terminator(chars[j].1);
            j += 1;
        }
        while j < chars.len() && is_closer(chars[j].1) {
            j += 1;
        }

        let at_end = j == chars.len();
        let boundary = if run_has_wide {
            true
        } else if at_end {
            let lone_period_after_digit = j == run_start + 1
                && c == '.'
                && run_start > 0
                && chars[run_start - 1].1.is_ascii_digit();
            !lone_period_after_digit
        } else {
            chars[j].1.is_whitespace()
        };

        if boundary {
            let end = chars.get(j).map_or(text.len(), |(offset, _)| *offset);
            let sentence = text[start..end].trim();
            if sentence.chars().any(has_content) {
                sentences.push(sentence.to_string());
            }
            start = end;
        }
        i = j;
    }

    Segmented {
        sentences,
        remainder: text[start..].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_completed_sentences_and_keeps_tail() {
        let out = split_sentences("Hello world. How are you? I am");
        assert_eq!(out.sentences, vec!["Hello world.", "How are you?"]);
        assert_eq!(out.remainder, " I am");
    }

    #[test]
    fn unterminated_text_is_all_remainder() {
        let out = split_sentences("Hello wor");
        assert!(out.sentences.is_empty());
        assert_eq!(out.remainder, "Hello wor");
    }

    #[test]
    fn terminator_at_end_of_text_completes_sentence() {
        let out = split_sentences("Hello world. How are you?");
        assert_eq!(out.sentences, vec!["Hello world.", "How are you?"]);
        assert_eq!(out.remainder, "");
    }

    #[test]
    fn decimal_numbers_are_not_split() {
        let out = split_sentences("Pi is 3.14 roughly. Next");
        assert_eq!(out.sentences, vec!["Pi is 3.14 roughly."]);
        assert_eq!(out.remainder, " Next");

        let held = split_sentences("It costs 3.");
        assert!(held.sentences.is_empty());
        assert_eq!(held.remainder, "It costs 3.");
    }

    #[test]
    fn terminator_runs_and_closing_quotes_stay_together() {
        let out = split_sentences("Really?! \"Yes.\" Fine... ok");
        assert_eq!(out.sentences, vec!["Really?!", "\"Yes.\"", "Fine..."]);
        assert_eq!(out.remainder, " ok");
    }

    #[test]
    fn full_width_terminators_split_without_spaces() {
        let out = split_sentences("你好。今天天气很好！明天");
        assert_eq!(out.sentences, vec!["你好。", "今天天气很好！"]);
        assert_eq!(out.remainder, "明天");
    }

    #[test]
    fn stray_terminators_do_not_produce_empty_sentences() {
        let out = split_sentences(". ! ok");
        assert!(out.sentences.is_empty());
        assert_eq!(out.remainder, " ok");
    }

    #[test]
    fn symbol_only_sentences_are_kept() {
        let out = split_sentences("😊! ... Next");
        assert_eq!(out.sentences, vec!["😊!"]);
        assert_eq!(out.remainder, " Next");
    }

    #[test]
    fn segmentation_is_restartable() {
        let first = split_sentences("One. Tw");
        let second = split_sentences(&format!("{}o. Three", first.remainder));
        assert_eq!(first.sentences, vec!["One."]);
        assert_eq!(second.sentences, vec!["Two."]);
        assert_eq!(second.remainder, " Three");
    }
}
