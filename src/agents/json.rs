//! Pull a JSON object out of noisy model output.

/// The first balanced `{...}` object in `raw`, whether it stands alone, sits
/// in a markdown fence or is wrapped in prose. Falls back to the trimmed text
/// so the caller's parse error shows what the model actually said.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .find('{')
        .and_then(|start| {
            let object = &trimmed[start..];
            object_len(object).map(|len| &object[..len])
        })
        .unwrap_or(trimmed)
}

#[derive(Clone, Copy)]
enum Scan {
    Code,
    InString,
    Escaped,
}

/// Length in bytes of the object opening at `s[0]`. Braces inside string
/// literals do not count.
fn object_len(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut scan = Scan::Code;
    for (i, c) in s.char_indices() {
        scan = match (scan, c) {
            (Scan::Escaped, _) => Scan::InString,
            (Scan::InString, '\\') => Scan::Escaped,
            (Scan::InString, '"') => Scan::Code,
            (Scan::InString, _) => Scan::InString,
            (Scan::Code, '"') => Scan::InString,
            (Scan::Code, '{') => {
                depth += 1;
                Scan::Code
            }
            (Scan::Code, '}') => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
                Scan::Code
            }
            (Scan::Code, _) => Scan::Code,
        };
    }
    None
}
