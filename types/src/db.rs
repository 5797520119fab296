use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Timestamp,
    Json,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub mask: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DatabaseHandle {
    pub cluster_id: uuid::Uuid,
    pub db_id: String,
    pub name: String,
    pub description: Option<String>,
    pub tables: Vec<TableSchema>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CreateTable,
    UpdateSchema,
    Insert,
    Update,
    Delete,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct AuditEvent {
    /// `<table>/<rowid>/<seq>` for row events, `<table>/<seq>` for schema events.
    pub id: String,
    pub cluster_id: uuid::Uuid,
    pub db_id: String,
    pub table: String,
    pub action: AuditAction,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Prior/next values needed to invert the action. For `insert` this is just
    /// the inserted row; restoring an `insert` event is undefined.
    pub diff: serde_json::Value,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Maintainer,
    Admin,
}

impl Role {
    /// Maintainer/admin see raw masked values, viewer/editor do not.
    pub fn sees_masked_values(self) -> bool {
        matches!(self, Role::Maintainer | Role::Admin)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PermissionBinding {
    pub principal: String,
    /// `db:<id>` or `table:<name>`, kept as the wire string rather than parsed.
    pub scope: String,
    pub role: Role,
}
