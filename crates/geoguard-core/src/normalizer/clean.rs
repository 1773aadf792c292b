//! Markup stripping and unicode folding with an origin map.
//!
//! Every byte of cleaned output remembers the raw byte range it came from,
//! so clause spans computed on cleaned text map back to the original.
//!
//! Plain text is folded through the typographic table below and then NFKC
//! normalized. Composition runs over a base character and the combining
//! marks that follow it, and that whole cluster is the origin of every
//! output byte it yields.

use lazy_static::lazy_static;
use regex::Regex;
use std::ops::Range;
use unicode_normalization::char::canonical_combining_class;
use unicode_normalization::UnicodeNormalization;

use super::Span;

lazy_static! {
    /// HTML tags, HTML entities, markdown headings, list bullets and
    /// emphasis markers. Alternatives are tried left to right.
    static ref MARKUP: Regex = Regex::new(concat!(
        r"(?P<tag></?[A-Za-z][^<>\n]{0,200}>)",
        r"|(?P<entity>&(?:#[0-9]{1,7}|#[xX][0-9A-Fa-f]{1,6}|[A-Za-z]{2,8});)",
        r"|(?m:^[ \t]*(?P<heading>#{1,6})[ \t]+)",
        r"|(?m:^[ \t]*(?P<bullet>[-*+\x{2022}]|\d{1,3}[.)])[ \t]+)",
        r"|(?P<emphasis>\*{1,3}|__|~~|`+)",
    ))
    .unwrap();

    /// Tags that end a block of text.
    static ref BLOCK_TAG: Regex =
        Regex::new(r"(?i)^</?(?:br|p|div|li|ul|ol|tr|table|h[1-6]|section|article)\b").unwrap();
}

/// Cleaned text plus, per output byte, the raw range it was produced from.
#[derive(Debug, Default)]
pub(crate) struct CleanText {
    pub text: String,
    origin: Vec<(usize, usize)>,
}

impl CleanText {
    fn push_str(&mut self, s: &str, raw: &Range<usize>) {
        self.text.push_str(s);
        self.origin
            .extend(std::iter::repeat((raw.start, raw.end)).take(s.len()));
    }

    fn push_char(&mut self, c: char, raw: &Range<usize>) {
        let mut buf = [0u8; 4];
        self.push_str(c.encode_utf8(&mut buf), raw);
    }

    /// Map a non-empty cleaned byte range back to the raw text.
    pub fn raw_span(&self, range: Range<usize>) -> Option<Span> {
        if range.start >= range.end || range.end > self.origin.len() {
            return None;
        }
        let start = self.origin[range.start].0;
        let end = self.origin[range.end - 1].1;
        Some(Span { start, end })
    }
}

/// Strip markup and fold unicode, tracking origins.
pub(crate) fn clean(raw: &str) -> CleanText {
    let mut out = CleanText {
        text: String::with_capacity(raw.len()),
        origin: Vec::with_capacity(raw.len()),
    };
    let mut cursor = 0;

    for caps in MARKUP.captures_iter(raw) {
        let Some(whole) = caps.get(0) else { continue };
        fold_plain(&raw[cursor..whole.start()], cursor, &mut out);
        let range = whole.range();

        if let Some(tag) = caps.name("tag") {
            if BLOCK_TAG.is_match(tag.as_str()) {
                out.push_char('\n', &range);
            }
        } else if let Some(entity) = caps.name("entity") {
            match decode_entity(entity.as_str()) {
                Some(c) => fold_cluster(c.encode_utf8(&mut [0u8; 4]), &range, &mut out),
                // Unknown entity names are kept as plain text.
                None => fold_plain(entity.as_str(), entity.start(), &mut out),
            }
        }
        // Headings, bullets and emphasis markers are dropped.
        cursor = whole.end();
    }
    fold_plain(&raw[cursor..], cursor, &mut out);
    out
}

fn fold_plain(s: &str, offset: usize, out: &mut CleanText) {
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if i > start && canonical_combining_class(c) == 0 {
            fold_cluster(&s[start..i], &(offset + start..offset + i), out);
            start = i;
        }
    }
    if start < s.len() {
        fold_cluster(&s[start..], &(offset + start..offset + s.len()), out);
    }
}

fn fold_cluster(cluster: &str, range: &Range<usize>, out: &mut CleanText) {
    let mut folded = String::with_capacity(cluster.len());
    for c in cluster.chars() {
        match fold(c) {
            Folded::Drop => {}
            Folded::Char(ch) => folded.push(ch),
            Folded::Str(s) => folded.push_str(s),
        }
    }
    for c in folded.nfkc() {
        fold_char(c, range, out);
    }
}

enum Folded {
    Drop,
    Char(char),
    Str(&'static str),
}

fn fold_char(c: char, range: &Range<usize>, out: &mut CleanText) {
    match fold(c) {
        Folded::Drop => {}
        Folded::Char(ch) => out.push_char(ch, range),
        Folded::Str(s) => out.push_str(s, range),
    }
}

fn fold(c: char) -> Folded {
    match c {
        '\n' => Folded::Char('\n'),
        '\t' => Folded::Char(' '),
        '\u{2028}' | '\u{2029}' => Folded::Char('\n'),
        // zero-width and soft hyphen
        '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}' => Folded::Drop,
        '\u{00A0}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}' => {
            Folded::Char(' ')
        }
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => Folded::Char('\''),
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => Folded::Char('"'),
        '\u{2010}'..='\u{2015}' | '\u{2212}' => Folded::Char('-'),
        '\u{2026}' => Folded::Str("..."),
        // full-width ASCII block
        '\u{FF01}'..='\u{FF5E}' => {
            char::from_u32(c as u32 - 0xFEE0).map_or(Folded::Drop, Folded::Char)
        }
        c if c.is_control() => Folded::Drop,
        c => Folded::Char(c),
    }
}

fn decode_entity(entity: &str) -> Option<char> {
    let body = entity.strip_prefix('&')?.strip_suffix(';')?;
    if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
        return u32::from_str_radix(hex, 16).ok().and_then(char::from_u32);
    }
    if let Some(dec) = body.strip_prefix('#') {
        return dec.parse::<u32>().ok().and_then(char::from_u32);
    }
    match body {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        "ndash" | "mdash" => Some('-'),
        "hellip" => Some('\u{2026}'),
        "lsquo" | "rsquo" => Some('\''),
        "ldquo" | "rdquo" => Some('"'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_html_tags() {
        let cleaned = clean("<b>Curfew</b> for <i>minors</i>");
        assert_eq!(cleaned.text, "Curfew for minors");
    }

    #[test]
    fn test_block_tags_become_line_breaks() {
        let cleaned = clean("First<br/>Second<p>Third</p>");
        assert_eq!(cleaned.text, "First\nSecond\nThird\n");
    }

    #[test]
    fn test_decodes_entities() {
        let cleaned = clean("Parents &amp; guardians&nbsp;only &#8212; &#x41;");
        assert_eq!(cleaned.text, "Parents & guardians only - A");
    }

    #[test]
    fn test_unknown_entity_kept() {
        let cleaned = clean("a &bogus; b");
        assert_eq!(cleaned.text, "a &bogus; b");
    }

    #[test]
    fn test_markdown_removed() {
        let cleaned = clean("# Title\n- **age gate** for `minors`\n1. Step");
        assert_eq!(cleaned.text, "Title\nage gate for minors\nStep");
    }

    #[test]
    fn test_unicode_folding() {
        let cleaned = clean("\u{201C}Kids\u{201D}\u{00A0}mode\u{2014}on\u{200B}\u{2026}\u{FF21}");
        assert_eq!(cleaned.text, "\"Kids\" mode-on...A");
    }

    #[test]
    fn test_decomposed_accents_compose() {
        let raw = "Cafe\u{301} cre\u{300}me";
        let cleaned = clean(raw);
        assert_eq!(cleaned.text, "Caf\u{e9} cr\u{e8}me");

        let start = cleaned.text.find('\u{e9}').unwrap();
        let span = cleaned.raw_span(start..start + '\u{e9}'.len_utf8()).unwrap();
        assert_eq!(&raw[span.start..span.end], "e\u{301}");
    }

    #[test]
    fn test_compatibility_forms_fold() {
        // ligature, superscript, circled digit, fraction
        let cleaned = clean("\u{FB01}le \u{00B2} \u{2460} \u{00BD}");
        assert_eq!(cleaned.text, "file 2 1 1\u{2044}2");
    }

    #[test]
    fn test_control_characters_dropped() {
        let cleaned = clean("a\r\nb\u{0007}c\td");
        assert_eq!(cleaned.text, "a\nbc d");
    }

    #[test]
    fn test_origin_maps_back_to_raw() {
        let raw = "<b>Utah</b> \u{201C}minors\u{201D}";
        let cleaned = clean(raw);
        assert_eq!(cleaned.text, "Utah \"minors\"");

        let start = cleaned.text.find("minors").unwrap();
        let span = cleaned.raw_span(start..start + "minors".len()).unwrap();
        assert_eq!(&raw[span.start..span.end], "minors");

        let span = cleaned.raw_span(0..cleaned.text.len()).unwrap();
        assert_eq!(&raw[span.start..span.end], "Utah</b> \u{201C}minors\u{201D}");
    }

    #[test]
    fn test_empty_range_has_no_span() {
        let cleaned = clean("abc");
        assert!(cleaned.raw_span(1..1).is_none());
        assert!(cleaned.raw_span(0..10).is_none());
    }
}
