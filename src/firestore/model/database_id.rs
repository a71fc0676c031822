use std::fmt::{Display, Formatter};

pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Project and database pair addressed by a client.
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

    pub fn default_database(project_id: impl Into<String>) -> Self {
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

    /// `projects/{project}/databases/{database}` as used in wire requests.
    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.database_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_database_name() {
        let db = DatabaseId::default_database("project");
        assert!(db.is_default_database());
        assert_eq!(db.database_name(), "projects/project/databases/(default)");
    }
}
