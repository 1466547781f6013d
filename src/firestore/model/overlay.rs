use crate::firestore::model::{DocumentKey, Mutation};

/// Net effect of every pending batch on one document, folded into a single
/// mutation. Derived from the mutation queue and always recomputable.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    largest_batch_id: i32,
    mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn largest_batch_id(&self) -> i32 {
        self.largest_batch_id
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}
