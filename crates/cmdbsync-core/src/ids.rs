//! Ordered id lists stored as a single hash field value.
//!
//! Consumers of the cache read reverse indices as `"[1,2,3]"`, so the
//! list is kept as plain integers in memory and only turned into that
//! text when written.

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdList(Vec<i64>);

impl IdList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, id: i64) {
        self.0.push(id);
    }

    /// Remove every occurrence of `id`. Returns true if anything was removed.
    pub fn remove(&mut self, id: i64) -> bool {
        let before = self.0.len();
        self.0.retain(|v| *v != id);
        self.0.len() != before
    }

    pub fn contains(&self, id: i64) -> bool {
        self.0.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    /// Parse the stored form. Anything that is not a JSON integer array
    /// yields `None`.
    pub fn parse(stored: &str) -> Option<Self> {
        serde_json::from_str::<Vec<i64>>(stored).ok().map(Self)
    }

    pub fn to_store_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IdList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{id}")?;
        }
        f.write_str("]")
    }
}

impl From<Vec<i64>> for IdList {
    fn from(ids: Vec<i64>) -> Self {
        Self(ids)
    }
}

impl FromIterator<i64> for IdList {
    fn from_iter<T: IntoIterator<Item = i64>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
