//! Split a markdown answer into typed segments.
//!
//! Images, code fences, tables, headings and list blocks are found first and
//! merged into atomic regions. Everything between them is split into
//! paragraphs and then sentences. Offsets are byte offsets into the text after
//! `\r\n` normalisation.

use std::ops::Range;

use fancy_regex::Regex as FancyRegex;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Sentence,
    List,
    Table,
    Image,
    Header,
    Code,
}

impl SegmentKind {
    /// Kinds that are never cited.
    pub fn is_protected(self) -> bool {
        matches!(
            self,
            SegmentKind::Image | SegmentKind::Header | SegmentKind::Code | SegmentKind::Table
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    /// Every kind merged into this span, in order of discovery.
    pub kinds: Vec<SegmentKind>,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub protected: bool,
}

impl Segment {
    pub fn is(&self, kind: SegmentKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// A lone sentence, as opposed to any structural block.
    pub fn is_plain(&self) -> bool {
        self.kinds == [SegmentKind::Sentence]
    }
}

static MARKDOWN_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)]+\)").expect("invalid image regex"));
static HTML_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<img[^>]+>").expect("invalid img regex"));
static HTML_DIV: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<div[^>]*>.*?</div>").expect("invalid div regex"));
static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[^\n]*\n.*?```").expect("invalid code regex"));
static TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|[^\n]+\|\n\|[-:| ]+\|\n(?:\|[^\n]+\|(?:\n|\z))+").expect("invalid table regex")
});
static HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#{1,6}[ \t]+.+$").expect("invalid header regex"));
static LIST_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[•\-*]|\d+[.)]|[a-z][.)]|[ivxlcdm]+[.)])(?:\s|$)").expect("invalid list regex")
});
static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n").expect("invalid paragraph regex"));
// Terminal punctuation, optionally closed by a quote or bracket, then a capital.
static SENTENCE_BREAK: Lazy<FancyRegex> = Lazy::new(|| {
    FancyRegex::new(r#"(?<=[.!?])\s+(?=[A-Z])|(?<=[.!?]["')\]])\s+(?=[A-Z])"#)
        .expect("invalid sentence regex")
});

#[derive(Debug, Clone)]
struct Region {
    span: Range<usize>,
    kinds: Vec<SegmentKind>,
}

pub fn is_list_item(line: &str) -> bool {
    LIST_ITEM.is_match(line)
}

fn is_indented(line: &str) -> bool {
    line.starts_with("    ") || line.starts_with('\t')
}

/// Segment `text` into document-ordered, non-overlapping segments.
pub fn segment(text: &str) -> Vec<Segment> {
    let text = normalize_newlines(text);
    let text = text.as_str();

    let regions = merge_regions(structural_regions(text));

    let mut segments = Vec::new();
    let mut cursor = 0;
    for region in &regions {
        if region.span.start > cursor {
            split_sentences(text, cursor..region.span.start, &mut segments);
        }
        if let Some(segment) = region_segment(text, region) {
            segments.push(segment);
        }
        cursor = cursor.max(region.span.end);
    }
    if cursor < text.len() {
        split_sentences(text, cursor..text.len(), &mut segments);
    }

    segments.sort_by_key(|s| s.start);
    segments
}

pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn structural_regions(text: &str) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut push_matches = |re: &Regex, kind: SegmentKind| {
        for m in re.find_iter(text) {
            regions.push(Region {
                span: m.range(),
                kinds: vec![kind],
            });
        }
    };

    push_matches(&MARKDOWN_IMAGE, SegmentKind::Image);
    push_matches(&HTML_IMAGE, SegmentKind::Image);
    push_matches(&HTML_DIV, SegmentKind::Image);
    push_matches(&CODE_FENCE, SegmentKind::Code);
    push_matches(&TABLE, SegmentKind::Table);
    push_matches(&HEADER, SegmentKind::Header);

    regions.extend(list_blocks(text).into_iter().map(|span| Region {
        span,
        kinds: vec![SegmentKind::List],
    }));
    regions
}

/// Byte spans of list blocks.
///
/// A block opens on a list item and stays open through further items, indented
/// continuation lines, and blank lines that are followed by another item or an
/// indented line. Any other non-blank line closes it.
pub fn list_blocks(text: &str) -> Vec<Range<usize>> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut blocks = Vec::new();
    let mut open: Option<usize> = None;
    let mut pos = 0;

    for (i, line) in lines.iter().enumerate() {
        let item = is_list_item(line);
        let blank = line.trim().is_empty();

        match open {
            None if item => open = Some(pos),
            Some(start) if blank => {
                let continues = lines
                    .get(i + 1)
                    .is_some_and(|next| is_list_item(next) || is_indented(next));
                if !continues {
                    blocks.push(start..pos);
                    open = None;
                }
            }
            Some(start) if !item && !is_indented(line) => {
                blocks.push(start..pos);
                open = None;
            }
            _ => {}
        }
        pos += line.len() + 1;
    }

    if let Some(start) = open {
        blocks.push(start..text.len());
    }
    blocks
}

/// Sort by start and merge spans that overlap or touch, unioning their kinds.
fn merge_regions(mut regions: Vec<Region>) -> Vec<Region> {
    regions.sort_by_key(|r| (r.span.start, r.span.end));
    let mut merged: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        match merged.last_mut() {
            Some(current) if region.span.start <= current.span.end => {
                current.span.end = current.span.end.max(region.span.end);
                for kind in region.kinds {
                    if !current.kinds.contains(&kind) {
                        current.kinds.push(kind);
                    }
                }
            }
            _ => merged.push(region),
        }
    }
    merged
}

fn region_segment(text: &str, region: &Region) -> Option<Segment> {
    let span = trim_span(text, region.span.clone())?;
    Some(Segment {
        protected: region.kinds.iter().any(|k| k.is_protected()),
        kinds: region.kinds.clone(),
        text: text[span.clone()].to_string(),
        start: span.start,
        end: span.end,
    })
}

fn split_sentences(text: &str, span: Range<usize>, out: &mut Vec<Segment>) {
    let gap = &text[span.clone()];
    let mut para_start = 0;
    let mut paragraphs = Vec::new();
    for m in PARAGRAPH_BREAK.find_iter(gap) {
        paragraphs.push(para_start..m.start());
        para_start = m.end();
    }
    paragraphs.push(para_start..gap.len());

    for para in paragraphs {
        let base = span.start + para.start;
        let paragraph = &text[base..span.start + para.end];

        let mut sentence_start = 0;
        let mut pieces = Vec::new();
        for m in SENTENCE_BREAK.find_iter(paragraph).flatten() {
            pieces.push(sentence_start..m.start());
            sentence_start = m.end();
        }
        pieces.push(sentence_start..paragraph.len());

        for piece in pieces {
            let Some(range) = trim_span(text, base + piece.start..base + piece.end) else {
                continue;
            };
            out.push(Segment {
                kinds: vec![SegmentKind::Sentence],
                text: text[range.clone()].to_string(),
                start: range.start,
                end: range.end,
                protected: false,
            });
        }
    }
}

fn trim_span(text: &str, span: Range<usize>) -> Option<Range<usize>> {
    let slice = &text[span.clone()];
    let leading = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = span.start + leading;
    Some(start..start + trimmed.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(segments: &[Segment]) -> Vec<Vec<SegmentKind>> {
        segments.iter().map(|s| s.kinds.clone()).collect()
    }

    #[test]
    fn sentences_split_on_terminal_punctuation_before_capital() {
        let segs = segment("The pump primes itself. Check the seal first! Is it dry? yes it is.");
        let texts: Vec<&str> = segs.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "The pump primes itself.",
                "Check the seal first!",
                "Is it dry? yes it is."
            ]
        );
        assert!(segs.iter().all(|s| s.is_plain() && !s.protected));
    }

    #[test]
    fn sentence_after_closing_quote_is_split() {
        let segs = segment("Set mode to \"auto.\" Then restart.");
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[1].text, "Then restart.");
    }

    #[test]
    fn paragraphs_split_on_blank_lines() {
        let text = "First paragraph here\n\n  \nSecond paragraph here";
        let segs = segment(text);
        assert_eq!(segs.len(), 2);
        assert_eq!(&text[segs[1].start..segs[1].end], "Second paragraph here");
    }

    #[test]
    fn protected_regions_are_detected() {
        let text = "# Overview\n\
                    Intro sentence about the unit.\n\n\
                    ![diagram](img/p3.png)\n\n\
                    ```bash\nsystemctl restart pump\n```\n\n\
                    | a | b |\n|---|---|\n| 1 | 2 |\n\n\
                    Closing sentence.";
        let segs = segment(text);
        assert_eq!(
            kinds(&segs),
            vec![
                vec![SegmentKind::Header],
                vec![SegmentKind::Sentence],
                vec![SegmentKind::Image],
                vec![SegmentKind::Code],
                vec![SegmentKind::Table],
                vec![SegmentKind::Sentence],
            ]
        );
        assert!(segs[0].protected);
        assert!(segs[2].protected && segs[3].protected && segs[4].protected);
        assert_eq!(segs[4].text, "| a | b |\n|---|---|\n| 1 | 2 |");
    }

    #[test]
    fn html_images_and_divs_are_images() {
        let segs = segment("Before text.\n\n<IMG src=\"a.png\">\n\n<div align=\"center\">\nx\n</div>");
        assert_eq!(segs[1].kinds, vec![SegmentKind::Image]);
        assert_eq!(segs[2].kinds, vec![SegmentKind::Image]);
    }

    #[test]
    fn list_block_tolerates_blank_lines_and_continuations() {
        let text = "Steps:\n\
                    1. Close the valve.\n\
                    \x20\x20\x20\x20Wait for pressure to drop.\n\
                    \n\
                    2. Open the drain.\n\
                    - nested bullet\n\
                    \n\
                    After the list.";
        let blocks = list_blocks(text);
        assert_eq!(blocks.len(), 1);
        let block = &text[blocks[0].clone()];
        assert!(block.starts_with("1. Close"));
        assert!(block.contains("nested bullet"));
        assert!(!block.contains("After the list"));

        let segs = segment(text);
        assert_eq!(
            kinds(&segs),
            vec![
                vec![SegmentKind::Sentence],
                vec![SegmentKind::List],
                vec![SegmentKind::Sentence]
            ]
        );
        assert!(!segs[1].protected);
        assert!(segs[1].text.ends_with("- nested bullet"));
    }

    #[test]
    fn list_closed_by_plain_line() {
        let text = "- a item\n- b item\nPlain line follows.";
        let blocks = list_blocks(text);
        assert_eq!(&text[blocks[0].clone()], "- a item\n- b item\n");
    }

    #[test]
    fn list_item_markers() {
        assert!(is_list_item("• bullet"));
        assert!(is_list_item("  * star"));
        assert!(is_list_item("12) twelve"));
        assert!(is_list_item("b. letter"));
        assert!(is_list_item("iv) roman"));
        assert!(!is_list_item("Plain text"));
        assert!(!is_list_item("-no space"));
        assert!(!is_list_item("3.5 bar is the limit"));
        assert!(!is_list_item("e.g. the pump primes itself"));
    }

    #[test]
    fn decimal_lines_stay_sentences() {
        let segs = segment("Intro line here.
3.5 bar is the relief limit.");
        assert!(segs.iter().all(|s| !s.is(SegmentKind::List)));
    }

    #[test]
    fn touching_regions_merge_and_union_kinds() {
        // The list runs up to the header line, so the spans touch.
        let text = "- one\n- two\n## Next\n\nBody text.";
        let segs = segment(text);
        assert_eq!(segs[0].kinds, vec![SegmentKind::List, SegmentKind::Header]);
        assert!(segs[0].protected);
        assert_eq!(segs[0].text, "- one\n- two\n## Next");
        assert!(segs[1].is_plain());
    }

    #[test]
    fn segments_never_overlap() {
        let text = "# Title\nText one. Text two.\n\n- item\n- item two\n\n```\ncode. Not split.\n```\nEnd.";
        let segs = segment(text);
        for pair in segs.windows(2) {
            assert!(pair[0].end <= pair[1].start, "{pair:?}");
        }
    }

    #[test]
    fn crlf_is_normalised() {
        let segs = segment("# Head\r\nBody line.");
        assert_eq!(segs[0].text, "# Head");
        assert_eq!(segs[1].text, "Body line.");
    }

    #[test]
    fn empty_input_has_no_segments() {
        assert!(segment("").is_empty());
        assert!(segment("  \n\n ").is_empty());
    }
}
