//! Re-emit segments with their citations.

use super::segment::{Segment, SegmentKind};
use super::Citation;

/// Join segments in document order, appending ` [n](page)` to cited ones.
///
/// Segments are separated by a blank line, except that consecutive headings are
/// kept on adjacent lines.
pub fn render(segments: &[Segment], citations: &[Option<Citation>]) -> String {
    let mut out = String::new();
    let mut previous: Option<&Segment> = None;

    for (idx, segment) in segments.iter().enumerate() {
        if let Some(prev) = previous {
            out.push_str(separator(prev, segment));
        }
        out.push_str(&segment.text);
        if let Some(Some(citation)) = citations.get(idx) {
            out.push_str(&format!(" [{}]({})", citation.index, citation.page));
        }
        previous = Some(segment);
    }
    out
}

fn separator(previous: &Segment, next: &Segment) -> &'static str {
    if previous.is(SegmentKind::Header) && next.is(SegmentKind::Header) {
        "\n"
    } else {
        "\n\n"
    }
}
