//! Best-candidate selection
//!
//! Shared by OCR variant selection and recognition path selection: given
//! candidates and a scoring function, keep the highest-scoring one.

/// A candidate that survived scoring
#[derive(Debug, Clone)]
pub struct Scored<T> {
    /// The winning value
    pub value: T,
    /// Its score
    pub score: f32,
    /// Position of the candidate in the input sequence
    pub index: usize,
}

/// Pick the highest-scoring candidate.
///
/// Candidates scored `None` (or NaN) are ignored. Ties keep the earliest
/// candidate, so the input order acts as the priority order.
pub fn best_of<T, I, F>(candidates: I, mut score: F) -> Option<Scored<T>>
where
    I: IntoIterator<Item = T>,
    F: FnMut(&T) -> Option<f32>,
{
    let mut best: Option<Scored<T>> = None;

    for (index, value) in candidates.into_iter().enumerate() {
        let Some(s) = score(&value).filter(|s| !s.is_nan()) else {
            continue;
        };

        let better = match &best {
            Some(current) => s > current.score,
            None => true,
        };

        if better {
            best = Some(Scored { value, score: s, index });
        }
    }

    best
}
