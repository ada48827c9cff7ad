//! OCR text normalization
//!
//! Turns raw recognizer output into the canonical form used as the question
//! bank lookup key. The transform is total and idempotent: normalizing an
//! already normalized string returns it unchanged.

use regex::Regex;
use std::sync::OnceLock;

/// Characters OCR produces from borders, underlines and scan artifacts
const NOISE_CHARS: &[char] = &['|', '_', '~', '^', '`', '¢', '£', '©', '®', '™'];

/// Characters that never take a space before them
const CLOSING_MARKS: &str = "。、！？：；）」】";

/// Characters that never take a space after them
const OPENING_MARKS: &str = "（「【";

/// Digit, operator, digit with at least one space somewhere between them
fn operator_spacing() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d)(?:\s+([+\-×÷=])\s*|([+\-×÷=])\s+)(\d)").ok())
        .as_ref()
}

/// A trailing `=` after a digit, as in `1 + 1 =`
fn equals_spacing() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d)\s+=").ok()).as_ref()
}

/// Normalize raw OCR output.
pub fn normalize(raw: &str) -> String {
    let mapped = map_chars(raw);
    let collapsed = mapped.split_whitespace().collect::<Vec<_>>().join(" ");
    let tightened = tighten_punctuation(&collapsed);
    let joined = join_arithmetic(tightened);
    joined.trim().to_string()
}

/// Per-character folding, noise removal and bracket canonicalization
fn map_chars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());

    for c in raw.chars() {
        if NOISE_CHARS.contains(&c) {
            continue;
        }

        match c {
            // Full-width digits and Latin letters
            '０'..='９' | 'Ａ'..='Ｚ' | 'ａ'..='ｚ' => {
                let folded = char::from_u32(c as u32 - 0xFEE0).unwrap_or(c);
                out.push(folded);
            }
            '＋' => out.push('+'),
            '－' | '−' => out.push('-'),
            '＝' => out.push('='),
            '＜' => out.push('<'),
            '＞' => out.push('>'),
            '％' => out.push('%'),
            '．' => out.push('.'),
            '，' => out.push(','),
            '／' => out.push('/'),
            '…' => out.push_str("..."),
            '\u{2015}' => out.push('\u{2014}'),

            // Canonical full-width brackets and marks
            '(' => out.push('（'),
            ')' => out.push('）'),
            '[' | '［' | '｢' => out.push('「'),
            ']' | '］' | '｣' => out.push('」'),
            '{' | '｛' => out.push('【'),
            '}' | '｝' => out.push('】'),
            '!' => out.push('！'),
            '?' => out.push('？'),

            _ => out.push(c),
        }
    }

    out
}

/// Drop single spaces before closing marks and after opening marks.
///
/// Input must already be whitespace-collapsed.
fn tighten_punctuation(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());

    for (i, &c) in chars.iter().enumerate() {
        if c == ' ' {
            let before_closer = chars.get(i + 1).is_some_and(|n| CLOSING_MARKS.contains(*n));
            let after_opener = i > 0 && OPENING_MARKS.contains(chars[i - 1]);
            if before_closer || after_opener {
                continue;
            }
        }
        out.push(c);
    }

    out
}

/// Remove spaces inside digit-operator-digit runs until nothing changes.
///
/// Both patterns need a space to match, so every pass that matches makes the
/// text shorter. Chained runs like `1 + 2 + 3` share digits between matches
/// and take more than one pass.
fn join_arithmetic(mut text: String) -> String {
    let (Some(operators), Some(equals)) = (operator_spacing(), equals_spacing()) else {
        return text;
    };

    loop {
        let joined = operators.replace_all(&text, "$1$2$3$4");
        let next = equals.replace_all(&joined, "$1=").into_owned();
        if next == text {
            return text;
        }
        text = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_noise_and_collapses_whitespace() {
        assert_eq!(normalize("  |問題  １_\n\n次の  "), "問題 1 次の");
        assert_eq!(normalize("a\u{3000}\u{3000}b"), "a b");
    }

    #[test]
    fn test_fullwidth_folding() {
        assert_eq!(normalize("ＡＢＣ１２３"), "ABC123");
        assert_eq!(normalize("３＋４＝７"), "3+4=7");
        assert_eq!(normalize("５０％．"), "50%.");
        assert_eq!(normalize("a…b"), "a...b");
        assert_eq!(normalize("x\u{2015}y"), "x\u{2014}y");
    }

    #[test]
    fn test_space_before_period_removed() {
        assert_eq!(normalize("これはテストです 。"), "これはテストです。");
        assert_eq!(normalize("はい 、いいえ ？"), "はい、いいえ？");
    }

    #[test]
    fn test_bracket_canonicalization() {
        assert_eq!(normalize("( 答え )"), "（答え）");
        assert_eq!(normalize("[ 語 ]"), "「語」");
        assert_eq!(normalize("{ 注 }"), "【注】");
        assert_eq!(normalize("｢引用｣"), "「引用」");
        assert_eq!(normalize("本当!"), "本当！");
    }

    #[test]
    fn test_arithmetic_spacing() {
        assert_eq!(normalize("3 + 4 = 7"), "3+4=7");
        assert_eq!(normalize("1 + 2 + 3 + 4"), "1+2+3+4");
        assert_eq!(normalize("6 ÷ 2 × 3"), "6÷2×3");
        assert_eq!(normalize("８ － ５"), "8-5");
        assert_eq!(normalize("12 +3 - 4"), "12+3-4");
        assert_eq!(normalize("10 × 10 × 10 × 10 = 10000"), "10×10×10×10=10000");
    }

    #[test]
    fn test_trailing_equals_joins() {
        assert_eq!(normalize("1 + 1 ＝"), "1+1=");
        assert_eq!(normalize("1 + 1 ＝ ？"), "1+1=？");
    }

    #[test]
    fn test_operator_between_words_untouched() {
        assert_eq!(normalize("Chapter 1 - intro"), "Chapter 1 - intro");
        assert_eq!(normalize("x = y"), "x = y");
    }

    #[test]
    fn test_empty_and_noise_only() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
        assert_eq!(normalize("|_~^"), "");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "  次の計算をしなさい 。 ３ ＋ ４ ＝ ？  ",
            "( A ) 東京  [ B ] 大阪",
            "1 + 2 + 3 = 6 !",
            "｢ 引用 ｣ ｛ 注 ｝…",
            "mixed\tLatin | text__ with   noise",
            "（ 」 】",
            "",
        ];

        for s in samples {
            let once = normalize(s);
            let twice = normalize(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn test_latin_text_preserved() {
        assert_eq!(normalize("What is 2 + 2 ?"), "What is 2+2？");
    }
}
