use std::sync::Arc;

use tracing::debug;

use crate::domain::{DocKey, RawRecord, Scheme};
use crate::error::KiraError;
use crate::graph::{InputHint, KeyLookup, TranslationGraph};

/// Decides which root documents assert a new entity.
///
/// Each candidate is translated without fallback. A hit means the entity is
/// already asserted under its canonical key: the candidate loses its root role
/// and its groups are re-keyed onto the canonical document. A miss keeps it as
/// a root under its native key.
#[derive(Debug, Clone)]
pub struct RootSelector {
    lookup: KeyLookup,
}

/// Outcome of [`RootSelector::classify`].
#[derive(Debug, Clone, PartialEq)]
pub enum RootRole {
    /// Kept as a root under its native key.
    Root(RawRecord),
    /// Re-keyed into the canonical scheme; contributes groups only.
    Represented(RawRecord),
}

impl RootSelector {
    pub fn new(graph: Arc<TranslationGraph>, inputs: Vec<InputHint>, canonical: Scheme) -> Self {
        Self {
            lookup: KeyLookup::new(graph, inputs, vec![canonical]),
        }
    }

    pub fn validate(&self, source_name: &str) -> Result<(), KiraError> {
        self.lookup.validate(source_name)
    }

    /// The canonical key of the record, if it translates.
    pub fn canonical_key(&self, record: &RawRecord) -> Result<Option<DocKey>, KiraError> {
        Ok(self.lookup.resolve(record)?.map(|resolved| resolved.key))
    }

    pub fn classify(&self, record: RawRecord) -> Result<RootRole, KiraError> {
        match self.canonical_key(&record)? {
            Some(key) => {
                debug!(key = %record.key, canonical = %key, "root document suppressed");
                Ok(RootRole::Represented(RawRecord {
                    key,
                    payload: record.payload,
                }))
            }
            None => Ok(RootRole::Root(record)),
        }
    }

    /// Keeps the records that remain roots under their native key.
    pub fn filter<'a, I>(
        &'a self,
        records: I,
    ) -> impl Iterator<Item = Result<RawRecord, KiraError>> + 'a
    where
        I: IntoIterator<Item = RawRecord>,
        I::IntoIter: 'a,
    {
        records
            .into_iter()
            .filter_map(move |record| match self.classify(record) {
                Ok(RootRole::Root(record)) => Some(Ok(record)),
                Ok(RootRole::Represented(_)) => None,
                Err(err) => Some(Err(err)),
            })
    }
}
