//! Access policy: which tables each role may query, which rows it sees,
//! and which columns stay hidden.
//!
//! The table is built once per process and never mutated. A table with no
//! entry for a role is treated exactly like an entry with `allowed = false`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Columns that no role may ever reference, admin included.
pub const SENSITIVE_COLUMNS: &[&str] = &[
    "password",
    "access_token",
    "refresh_token",
    "id_token",
    "api_key",
    "secret",
    "token",
    "admin_note",
];

/// Contact columns hidden from callers who only see another party's profile.
const CONTACT_COLUMNS: &[&str] = &["email", "phone"];

/// Auth and bookkeeping tables that only ever appear as explicit denials.
const AUTH_TABLES: &[&str] = &["account", "session", "verification"];

// ────────────────────────────────────────────────────────────────────────────
// Role
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Company,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Student, Role::Company, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Company => "company",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown role '{0}'")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "company" => Ok(Role::Company),
            "admin" => Ok(Role::Admin),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Policy entries
// ────────────────────────────────────────────────────────────────────────────

/// Access rule for one (role, table) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    pub allowed: bool,
    /// Boolean SQL expression with `:currentUserId`, `:currentStudentId` or
    /// `:currentCompanyId` placeholders.
    pub row_filter: Option<&'static str>,
    pub forbidden_columns: BTreeSet<&'static str>,
}

impl PolicyEntry {
    fn denied() -> Self {
        Self {
            allowed: false,
            row_filter: None,
            forbidden_columns: BTreeSet::new(),
        }
    }

    fn allowed() -> Self {
        Self {
            allowed: true,
            row_filter: None,
            forbidden_columns: SENSITIVE_COLUMNS.iter().copied().collect(),
        }
    }

    fn filtered(template: &'static str) -> Self {
        Self {
            row_filter: Some(template),
            ..Self::allowed()
        }
    }

    fn forbid(mut self, columns: &[&'static str]) -> Self {
        self.forbidden_columns.extend(columns.iter().copied());
        self
    }

    pub fn forbids_column(&self, column: &str) -> bool {
        self.forbidden_columns.contains(column)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Policy table
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct AccessPolicy {
    entries: HashMap<Role, HashMap<&'static str, PolicyEntry>>,
}

static CAMPUS_POLICY: Lazy<AccessPolicy> = Lazy::new(AccessPolicy::campus);

impl AccessPolicy {
    /// The process-wide policy for the placement portal.
    pub fn global() -> &'static AccessPolicy {
        &CAMPUS_POLICY
    }

    fn campus() -> Self {
        let mut entries = HashMap::new();
        for role in Role::ALL {
            entries.insert(role, Self::entries_for(role));
        }
        Self { entries }
    }

    fn entries_for(role: Role) -> HashMap<&'static str, PolicyEntry> {
        let mut table: HashMap<&'static str, PolicyEntry> = match role {
            Role::Student => HashMap::from([
                (
                    "students",
                    PolicyEntry::filtered("students.user_id = :currentUserId"),
                ),
                ("jobs", PolicyEntry::filtered("jobs.status = 'active'")),
                (
                    "applications",
                    PolicyEntry::filtered("applications.student_id = :currentStudentId"),
                ),
                ("companies", PolicyEntry::allowed().forbid(CONTACT_COLUMNS)),
                ("user", PolicyEntry::denied()),
                ("ai_queries", PolicyEntry::denied()),
                ("query_templates", PolicyEntry::denied()),
            ]),
            Role::Company => HashMap::from([
                (
                    "companies",
                    PolicyEntry::filtered("companies.user_id = :currentUserId"),
                ),
                (
                    "jobs",
                    PolicyEntry::filtered("jobs.company_id = :currentCompanyId"),
                ),
                (
                    "applications",
                    PolicyEntry::filtered(
                        "applications.job_id IN (SELECT id FROM jobs WHERE company_id = :currentCompanyId)",
                    ),
                ),
                (
                    "students",
                    PolicyEntry::filtered(
                        "students.id IN (SELECT student_id FROM applications WHERE job_id IN (SELECT id FROM jobs WHERE company_id = :currentCompanyId))",
                    )
                    .forbid(CONTACT_COLUMNS),
                ),
                ("user", PolicyEntry::denied()),
                ("ai_queries", PolicyEntry::denied()),
                ("query_templates", PolicyEntry::denied()),
            ]),
            Role::Admin => HashMap::from([
                ("students", PolicyEntry::allowed()),
                ("companies", PolicyEntry::allowed()),
                ("jobs", PolicyEntry::allowed()),
                ("applications", PolicyEntry::allowed()),
                ("user", PolicyEntry::allowed()),
                ("ai_queries", PolicyEntry::allowed()),
                ("query_templates", PolicyEntry::allowed()),
            ]),
        };
        for name in AUTH_TABLES {
            table.insert(*name, PolicyEntry::denied());
        }
        table
    }

    pub fn lookup(&self, role: Role, table: &str) -> Option<&PolicyEntry> {
        self.entries.get(&role).and_then(|tables| tables.get(table))
    }

    /// Default-deny: no entry means no access.
    pub fn can_access(&self, role: Role, table: &str) -> bool {
        self.lookup(role, table).is_some_and(|entry| entry.allowed)
    }

    pub fn row_filter(&self, role: Role, table: &str) -> Option<&'static str> {
        self.lookup(role, table)
            .filter(|entry| entry.allowed)
            .and_then(|entry| entry.row_filter)
    }

    /// Tables the role may query, sorted.
    pub fn allowed_tables(&self, role: Role) -> Vec<&'static str> {
        let mut tables: Vec<&'static str> = self
            .entries
            .get(&role)
            .map(|tables| {
                tables
                    .iter()
                    .filter(|(_, entry)| entry.allowed)
                    .map(|(name, _)| *name)
                    .collect()
            })
            .unwrap_or_default();
        tables.sort_unstable();
        tables
    }

    /// Every table named anywhere in the policy, allowed or denied.
    pub fn known_tables(&self) -> BTreeSet<&'static str> {
        self.entries
            .values()
            .flat_map(|tables| tables.keys().copied())
            .collect()
    }

    pub fn is_known_table(&self, table: &str) -> bool {
        self.entries
            .values()
            .any(|tables| tables.contains_key(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_is_case_insensitive() {
        assert_eq!("Student".parse::<Role>(), Ok(Role::Student));
        assert_eq!(" admin ".parse::<Role>(), Ok(Role::Admin));
        assert!("superuser".parse::<Role>().is_err());
    }

    #[test]
    fn test_unknown_table_is_denied_for_every_role() {
        let policy = AccessPolicy::global();
        for role in Role::ALL {
            assert!(policy.lookup(role, "payroll").is_none());
            assert!(!policy.can_access(role, "payroll"));
        }
    }

    #[test]
    fn test_admin_denied_auth_tables() {
        let policy = AccessPolicy::global();
        for table in ["account", "session", "verification"] {
            assert!(!policy.can_access(Role::Admin, table), "{table}");
        }
        assert!(policy.can_access(Role::Admin, "user"));
        assert!(policy.can_access(Role::Admin, "ai_queries"));
    }

    #[test]
    fn test_student_sees_companies_without_contact_columns() {
        let policy = AccessPolicy::global();
        let entry = policy.lookup(Role::Student, "companies").unwrap();
        assert!(entry.allowed);
        assert!(entry.row_filter.is_none());
        assert!(entry.forbids_column("email"));
        assert!(entry.forbids_column("phone"));
        assert!(entry.forbids_column("admin_note"));
    }

    #[test]
    fn test_company_row_filters_reference_company_id() {
        let policy = AccessPolicy::global();
        for table in ["jobs", "applications", "students"] {
            let filter = policy.row_filter(Role::Company, table).unwrap();
            assert!(filter.contains(":currentCompanyId"), "{table}");
        }
        assert_eq!(
            policy.row_filter(Role::Company, "companies"),
            Some("companies.user_id = :currentUserId")
        );
    }

    #[test]
    fn test_allowed_tables_sorted_and_exclude_denied() {
        let policy = AccessPolicy::global();
        assert_eq!(
            policy.allowed_tables(Role::Student),
            vec!["applications", "companies", "jobs", "students"]
        );
        let admin = policy.allowed_tables(Role::Admin);
        assert!(admin.contains(&"user"));
        assert!(!admin.contains(&"session"));
    }

    #[test]
    fn test_known_tables_include_denied_entries() {
        let known = AccessPolicy::global().known_tables();
        for table in ["students", "user", "account", "session", "query_templates"] {
            assert!(known.contains(table), "{table}");
        }
        assert!(!known.contains("payroll"));
    }
}
