//! Cleans model output before it is sent to a speech synthesizer.

/// Signature of a text-cleaning step. The pipeline never synthesizes text
/// that has not gone through one.
pub type Purifier = dyn Fn(&str) -> String + Send + Sync;

fn is_pictograph(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF   // emoticons, pictographs, transport, regional indicators
            | 0x2600..=0x27BF // misc symbols, dingbats
            | 0x2B00..=0x2BFF // arrows and stars used as emoji
            | 0xFE00..=0xFE0F // variation selectors
            | 0x200D          // zero-width joiner
            | 0x20E3          // combining keycap
            | 0xE0020..=0xE007F // tag characters
    )
}

/// Default purifier: strips emoji and markdown markup, normalizes
/// typographic punctuation, and collapses whitespace.
pub fn purify_for_speech(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if is_pictograph(c) {
            continue;
        }
        match c {
            '*' | '#' | '`' | '~' | '_' | '|' | '>' => out.push(' '),
            '“' | '”' | '„' | '«' | '»' => out.push('"'),
            '‘' | '’' | '‚' => out.push('\''),
            '—' | '–' => out.push_str(", "),
            '…' => out.push_str("..."),
            '\u{00A0}' => out.push(' '),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }

    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    // A dash replacement can leave ", ," or " ," behind.
    collapsed
        .replace(" ,", ",")
        .replace(",,", ",")
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}
