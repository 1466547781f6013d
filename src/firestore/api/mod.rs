mod snapshot;
mod user_data;

pub use snapshot::{DocumentChange, DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
pub use user_data::{parse_set_data, parse_update_data, parse_update_fields, SetOptions};
