//! Near-duplicate removal over embedding vectors.
//!
//! Two items are duplicates when the cosine similarity of their vectors is at
//! least the caller's threshold. The earliest occurrence always survives, and an
//! item marked as a duplicate never knocks out anything after it, so chains
//! `a ~ b ~ c` collapse onto `a` even when `a` and `c` are far apart.

/// Anything that carries an embedding vector.
pub trait Embedded {
    fn embedding(&self) -> &[f32];
}

impl Embedded for (String, Vec<f32>) {
    fn embedding(&self) -> &[f32] {
        &self.1
    }
}

impl Embedded for Vec<f32> {
    fn embedding(&self) -> &[f32] {
        self
    }
}

/// Cosine similarity, or `None` when the vectors differ in length or either is
/// all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

fn is_duplicate(a: &[f32], b: &[f32], threshold: f32) -> bool {
    cosine_similarity(a, b).is_some_and(|s| s >= threshold)
}

/// Order-stable dedup keeping the first of every near-duplicate group.
pub fn dedup<T: Embedded>(items: Vec<T>, threshold: f32) -> Vec<T> {
    let mut keep = vec![true; items.len()];
    for i in 0..items.len() {
        if !keep[i] {
            continue;
        }
        for j in (i + 1)..items.len() {
            if keep[j] && is_duplicate(items[i].embedding(), items[j].embedding(), threshold) {
                keep[j] = false;
            }
        }
    }
    items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, kept)| kept.then_some(item))
        .collect()
}

/// Whether `vector` is a near-duplicate of anything in `seen`.
pub fn is_represented(vector: &[f32], seen: &[Vec<f32>], threshold: f32) -> bool {
    seen.iter().any(|prior| is_duplicate(vector, prior, threshold))
}

/// Dedup a fresh batch, then drop anything already represented in `seen`.
pub fn dedup_against_seen<T: Embedded>(items: Vec<T>, seen: &[Vec<f32>], threshold: f32) -> Vec<T> {
    dedup(items, threshold)
        .into_iter()
        .filter(|item| !is_represented(item.embedding(), seen, threshold))
        .collect()
}

/// Index and score of the best match for `query`, ignoring vectors that cannot
/// be compared.
pub fn best_match<'a, I>(query: &[f32], candidates: I) -> Option<(usize, f32)>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    candidates
        .into_iter()
        .enumerate()
        .filter_map(|(idx, candidate)| cosine_similarity(query, candidate).map(|s| (idx, s)))
        .fold(None, |best: Option<(usize, f32)>, (idx, score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((idx, score)),
        })
}
