/// Heuristic token estimate used when the upstream omits eval counters.
///
/// CJK scripts run roughly 1.5 characters per token; everything else is
/// approximated at 4 characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    let mut cjk = 0u64;
    let mut other = 0u64;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    (cjk as f64 / 1.5 + other as f64 / 4.0).ceil() as u64
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{309F}'   // hiragana
        | '\u{30A0}'..='\u{30FF}' // katakana
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified
        | '\u{AC00}'..='\u{D7AF}' // hangul syllables
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn ascii_is_quarter_rate() {
        // 8 ascii chars / 4 = 2
        assert_eq!(estimate_tokens("hello!!!"), 2);
        // 9 chars -> ceil(2.25) = 3
        assert_eq!(estimate_tokens("hello!!!!"), 3);
    }

    #[test]
    fn cjk_is_two_thirds_rate() {
        // 3 kanji -> 3/1.5 = 2
        assert_eq!(estimate_tokens("日本語"), 2);
        // hangul counts as CJK
        assert_eq!(estimate_tokens("안녕하세요"), 4);
    }

    #[test]
    fn mixed_text_sums_both_rates() {
        // "hi " = 3 other, "日本" = 2 cjk -> ceil(3/4 + 2/1.5) = ceil(2.083) = 3
        assert_eq!(estimate_tokens("hi 日本"), 3);
    }
}
