//! Folding of consecutive same-key rows.
//!
//! Upstream tables (orthologs, genomic positions) usually list all rows of one
//! reference gene next to each other. [`ContiguousGroups`] emits a group as soon
//! as the key changes and flushes the last group at end of input. A key that
//! shows up again after other keys starts a new, separate group; rows are never
//! reordered.

/// Groups consecutive items sharing a key. `Err` items are passed through
/// immediately without closing the group being built.
pub struct ContiguousGroups<I, K, T, F> {
    rows: I,
    key_fn: F,
    current: Option<(K, Vec<T>)>,
}

impl<I, K, T, F> ContiguousGroups<I, K, T, F> {
    pub fn new(rows: I, key_fn: F) -> Self {
        Self {
            rows,
            key_fn,
            current: None,
        }
    }
}

impl<I, K, T, E, F> Iterator for ContiguousGroups<I, K, T, F>
where
    I: Iterator<Item = Result<T, E>>,
    K: PartialEq,
    F: FnMut(&T) -> K,
{
    type Item = Result<(K, Vec<T>), E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.rows.next() {
                Some(Ok(row)) => {
                    let key = (self.key_fn)(&row);
                    let same_key = matches!(&self.current, Some((current, _)) if *current == key);
                    if same_key {
                        if let Some((_, rows)) = self.current.as_mut() {
                            rows.push(row);
                        }
                    } else if let Some(finished) = self.current.replace((key, vec![row])) {
                        return Some(Ok(finished));
                    }
                }
                Some(Err(err)) => return Some(Err(err)),
                // end of input: flush whatever is still open
                None => return self.current.take().map(Ok),
            }
        }
    }
}

pub fn group_contiguous<I, K, T, E, F>(
    rows: I,
    key_fn: F,
) -> ContiguousGroups<I::IntoIter, K, T, F>
where
    I: IntoIterator<Item = Result<T, E>>,
    K: PartialEq,
    F: FnMut(&T) -> K,
{
    ContiguousGroups::new(rows.into_iter(), key_fn)
}
