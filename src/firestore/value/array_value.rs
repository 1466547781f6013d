use crate::firestore::value::{array_contains, FirestoreValue};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    pub fn contains(&self, value: &FirestoreValue) -> bool {
        array_contains(self, value)
    }

    /// Appends each element that is not already present.
    pub fn union_with(&self, elements: &[FirestoreValue]) -> Self {
        let mut values = self.values.clone();
        for element in elements {
            if !values.iter().any(|existing| existing == element) {
                values.push(element.clone());
            }
        }
        Self::new(values)
    }

    /// Drops every occurrence of each element.
    pub fn remove_all(&self, elements: &[FirestoreValue]) -> Self {
        Self::new(
            self.values
                .iter()
                .filter(|value| !elements.iter().any(|element| element == *value))
                .cloned()
                .collect(),
        )
    }
}
