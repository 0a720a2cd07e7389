use rustc_hash::FxHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use tracing::debug;

/// Unseen names land within this many indices of the median class.
const UNSEEN_OFFSET_MIN: i64 = -5;
const UNSEEN_OFFSET_SPAN: u64 = 10;

/// Maps team names to stable integer indices.
///
/// Names seen at fit time get their sorted position. Unseen names either
/// share one sentinel index or, with smart fallback, are spread around the
/// median index by a hash of the name, so the same name always lands on the
/// same index and a tree can still tell unseen names apart.
#[derive(Debug)]
pub struct EntityEncoder {
    index: HashMap<String, usize>,
    n_classes: usize,
    smart_fallback: bool,
}

impl EntityEncoder {
    pub fn fit<'a, I>(names: I, smart_fallback: bool) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let classes: BTreeSet<&str> = names.into_iter().collect();
        let index: HashMap<String, usize> = classes
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();
        EntityEncoder {
            n_classes: index.len(),
            index,
            smart_fallback,
        }
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Index shared by every unseen name when smart fallback is off.
    pub fn sentinel(&self) -> usize {
        self.n_classes
    }

    pub fn encode(&self, name: &str) -> usize {
        if let Some(i) = self.index.get(name) {
            return *i;
        }
        if !self.smart_fallback || self.n_classes == 0 {
            return self.sentinel();
        }

        let idx = self.dispersed_index(name);
        debug!("Unseen team '{}' encoded as {}", name, idx);
        idx
    }

    fn dispersed_index(&self, name: &str) -> usize {
        let mut hasher = FxHasher::default();
        name.hash(&mut hasher);
        let offset = (hasher.finish() % UNSEEN_OFFSET_SPAN) as i64 + UNSEEN_OFFSET_MIN;
        let median = ((self.n_classes - 1) / 2) as i64;
        (median + offset).clamp(0, self.n_classes as i64 - 1) as usize
    }
}
