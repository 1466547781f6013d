use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, ResourcePath};

/// Name of the database used when none is given.
pub const DEFAULT_DATABASE_ID: &str = "(default)";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    /// Database id for the project's `(default)` database.
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// `projects/{project}/databases/{database}`
    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    /// Fully qualified resource name of a document, as used on the wire and
    /// inside existence-filter bloom filters.
    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!("{}/documents/{}", self.database_name(), key.path())
    }

    /// Strips the `projects/../databases/../documents` prefix from a
    /// fully qualified name and returns the relative path.
    pub fn relative_path(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let prefix = format!("{}/documents", self.database_name());
        let relative = name
            .strip_prefix(&prefix)
            .ok_or_else(|| invalid_argument(format!("Resource name '{name}' is not in {prefix}")))?;
        ResourcePath::from_string(relative.trim_start_matches('/'))
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_parses_document_names() {
        let id = DatabaseId::for_project("demo");
        assert!(id.is_default_database());
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let name = id.document_name(&key);
        assert_eq!(name, "projects/demo/databases/(default)/documents/rooms/eros");
        assert_eq!(id.relative_path(&name).unwrap(), key.path().clone());
    }

    #[test]
    fn rejects_names_from_other_databases() {
        let id = DatabaseId::new("demo", "other");
        let err = id
            .relative_path("projects/demo/databases/(default)/documents/a/b")
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }
}
