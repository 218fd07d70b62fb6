use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tables that participate in offline sync.
///
/// Declaration order follows the static priority ranking, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Projects,
    SafetyIncidents,
    DailyReports,
    WorkflowItems,
    Tasks,
    PunchItems,
    Documents,
    Checklists,
    Meetings,
    Contacts,
}

impl TableName {
    pub const ALL: [TableName; 10] = [
        TableName::Projects,
        TableName::SafetyIncidents,
        TableName::DailyReports,
        TableName::WorkflowItems,
        TableName::Tasks,
        TableName::PunchItems,
        TableName::Documents,
        TableName::Checklists,
        TableName::Meetings,
        TableName::Contacts,
    ];

    /// Static sync priority. Higher drains first under constrained bandwidth.
    pub fn priority(self) -> i32 {
        match self {
            TableName::Projects => 100,
            TableName::SafetyIncidents => 95,
            TableName::DailyReports => 90,
            TableName::WorkflowItems => 85,
            TableName::Tasks => 80,
            TableName::PunchItems => 75,
            TableName::Documents => 70,
            TableName::Checklists => 65,
            TableName::Meetings => 60,
            TableName::Contacts => 50,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TableName::Projects => "projects",
            TableName::SafetyIncidents => "safety_incidents",
            TableName::DailyReports => "daily_reports",
            TableName::WorkflowItems => "workflow_items",
            TableName::Tasks => "tasks",
            TableName::PunchItems => "punch_items",
            TableName::Documents => "documents",
            TableName::Checklists => "checklists",
            TableName::Meetings => "meetings",
            TableName::Contacts => "contacts",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sync table: {0}")]
pub struct UnknownTable(pub String);

impl FromStr for TableName {
    type Err = UnknownTable;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TableName::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTable(s.to_string()))
    }
}

/// Persisted per-table sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSyncState {
    pub table: TableName,
    pub priority: i32,
    /// Highest server version confirmed for this table.
    pub cursor: u64,
    /// Millis of the last confirmed batch, if any.
    pub last_synced_at: Option<i64>,
}

impl TableSyncState {
    pub fn initial(table: TableName) -> Self {
        Self {
            table,
            priority: table.priority(),
            cursor: 0,
            last_synced_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_descend_in_declaration_order() {
        let priorities: Vec<i32> = TableName::ALL.iter().map(|t| t.priority()).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn parse_roundtrips_display() {
        for table in TableName::ALL {
            assert_eq!(table.to_string().parse::<TableName>().unwrap(), table);
        }
        assert!("invoices".parse::<TableName>().is_err());
    }
}
