//! Text canonicalization
//!
//! Folds visually confusable code points to ASCII, strips invisible
//! characters, and collapses padding runs used to push payloads out of a
//! reviewer's view.

/// Runs of identical special characters longer than this are collapsed
const MAX_SPECIAL_RUN: usize = 10;
/// Collapsed runs keep this many characters / blank lines
const COLLAPSED_RUN: usize = 3;
/// Runs of blank lines longer than this are collapsed
const MAX_BLANK_LINES: usize = 4;

/// Zero-width, bidi-control, and other invisible code points
pub fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{034F}'
            | '\u{061C}'
            | '\u{115F}'
            | '\u{1160}'
            | '\u{180E}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{2069}'
            | '\u{FE00}'..='\u{FE0F}'
            | '\u{FEFF}'
    )
}

/// Map a confusable character to its ASCII look-alike
pub fn fold_confusable(c: char) -> Option<char> {
    let code = c as u32;

    // Fullwidth ASCII block
    if (0xFF01..=0xFF5E).contains(&code) {
        return char::from_u32(code - 0xFEE0);
    }

    // Mathematical alphanumeric letters: 52-letter groups (A-Z, a-z)
    if (0x1D400..=0x1D6A3).contains(&code) {
        let idx = (code - 0x1D400) % 52;
        let base = if idx < 26 { b'A' as u32 } else { b'a' as u32 - 26 };
        return char::from_u32(base + idx);
    }

    // Mathematical digits
    if (0x1D7CE..=0x1D7FF).contains(&code) {
        return char::from_u32(b'0' as u32 + (code - 0x1D7CE) % 10);
    }

    let folded = match c {
        // Unicode spaces
        '\u{00A0}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}' => ' ',
        // Cyrillic
        'а' => 'a',
        'е' => 'e',
        'о' => 'o',
        'р' => 'p',
        'с' => 'c',
        'у' => 'y',
        'х' => 'x',
        'і' => 'i',
        'ј' => 'j',
        'ѕ' => 's',
        'һ' => 'h',
        'ԁ' => 'd',
        'А' => 'A',
        'В' => 'B',
        'Е' => 'E',
        'К' => 'K',
        'М' => 'M',
        'Н' => 'H',
        'О' => 'O',
        'Р' => 'P',
        'С' => 'C',
        'Т' => 'T',
        'Х' => 'X',
        'І' => 'I',
        'Ѕ' => 'S',
        // Greek
        'α' => 'a',
        'ο' => 'o',
        'ν' => 'v',
        'ι' => 'i',
        'Α' => 'A',
        'Β' => 'B',
        'Ε' => 'E',
        'Ζ' => 'Z',
        'Η' => 'H',
        'Ι' => 'I',
        'Κ' => 'K',
        'Μ' => 'M',
        'Ν' => 'N',
        'Ο' => 'O',
        'Ρ' => 'P',
        'Τ' => 'T',
        'Υ' => 'Y',
        'Χ' => 'X',
        // Typographic punctuation
        '\u{2018}' | '\u{2019}' | '\u{201B}' | '\u{2032}' => '\'',
        '\u{201C}' | '\u{201D}' | '\u{201F}' | '\u{2033}' => '"',
        '\u{2010}'..='\u{2015}' | '\u{2212}' => '-',
        '\u{2039}' => '<',
        '\u{203A}' => '>',
        _ => return None,
    };
    Some(folded)
}

/// Fold confusables and drop invisible code points
pub fn canonicalize(text: &str) -> String {
    text.chars()
        .filter(|c| !is_invisible(*c))
        .map(|c| fold_confusable(c).unwrap_or(c))
        .collect()
}

fn is_special(c: char) -> bool {
    !c.is_alphanumeric() && !c.is_whitespace()
}

/// Collapse long runs of one special character, then long runs of blank lines
pub fn collapse_runs(text: &str) -> String {
    collapse_blank_lines(&collapse_special_runs(text))
}

fn collapse_special_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let mut run = 1;
        while chars.peek() == Some(&c) {
            chars.next();
            run += 1;
        }
        let keep = if is_special(c) && run > MAX_SPECIAL_RUN {
            COLLAPSED_RUN
        } else {
            run
        };
        out.extend(std::iter::repeat(c).take(keep));
    }
    out
}

fn collapse_blank_lines(text: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut blank_run: Vec<&str> = Vec::new();

    for line in text.split('\n') {
        if line.trim().is_empty() {
            blank_run.push(line);
            continue;
        }
        flush_blank_run(&mut kept, &mut blank_run);
        kept.push(line);
    }
    flush_blank_run(&mut kept, &mut blank_run);
    kept.join("\n")
}

fn flush_blank_run<'a>(kept: &mut Vec<&'a str>, run: &mut Vec<&'a str>) {
    let keep = if run.len() > MAX_BLANK_LINES {
        COLLAPSED_RUN
    } else {
        run.len()
    };
    kept.extend(run.drain(..).take(keep));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_zero_width() {
        let text = "ig\u{200B}no\u{200D}re\u{FEFF} this";
        assert_eq!(canonicalize(text), "ignore this");
    }

    #[test]
    fn test_fold_fullwidth_and_cyrillic() {
        assert_eq!(canonicalize("ＩＧＮＯＲＥ"), "IGNORE");
        // Cyrillic а, о, е
        assert_eq!(canonicalize("ignоrе аll"), "ignore all");
    }

    #[test]
    fn test_fold_math_alphanumerics() {
        // MATHEMATICAL BOLD CAPITAL A, MATHEMATICAL BOLD SMALL A
        assert_eq!(canonicalize("\u{1D400}\u{1D41A}"), "Aa");
        assert_eq!(canonicalize("\u{1D7CF}"), "1");
    }

    #[test]
    fn test_ascii_untouched() {
        let text = "plain ASCII text, 123!";
        assert_eq!(canonicalize(text), text);
    }

    #[test]
    fn test_collapse_special_runs() {
        let text = format!("a{}b", "=".repeat(40));
        assert_eq!(collapse_runs(&text), "a===b");
        // Exactly ten is left alone
        let ten = format!("a{}b", "#".repeat(10));
        assert_eq!(collapse_runs(&ten), ten);
        // Alphanumeric runs are not special
        let letters = "x".repeat(20);
        assert_eq!(collapse_runs(&letters), letters);
    }

    #[test]
    fn test_collapse_blank_lines() {
        let text = format!("top{}bottom", "\n".repeat(8));
        assert_eq!(collapse_runs(&text), "top\n\n\n\nbottom");
        // Four blank lines are kept
        let four = "a\n\n\n\n\nb";
        assert_eq!(collapse_runs(four), four);
    }

    #[test]
    fn test_collapse_is_stable() {
        let text = format!("{}\n\n\n\n\n\n\nx", "*".repeat(30));
        let once = collapse_runs(&text);
        assert_eq!(collapse_runs(&once), once);
    }
}
