use std::collections::BTreeSet;

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    /// True if `path` equals, or is nested under, a path in the mask.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        Self::new(self.fields.iter().chain(other.fields.iter()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_nested_paths() {
        let mask = FieldMask::new([FieldPath::from_dot_separated("a.b").unwrap()]);
        assert!(mask.covers(&FieldPath::from_dot_separated("a.b.c").unwrap()));
        assert!(!mask.covers(&FieldPath::from_dot_separated("a").unwrap()));
    }
}
