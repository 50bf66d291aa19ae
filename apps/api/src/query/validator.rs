//! Static safety checks for model-generated SQL.
//!
//! Lexical checks run on the raw text first, so keywords and column names
//! hidden inside string literals are rejected too. The statement is then
//! parsed with the PostgreSQL dialect and checked structurally against the
//! access policy.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    Expr, Ident, ObjectName, ObjectNamePart, Query, SelectItem, SetExpr, Statement, TableAlias,
    TableFactor, TableWithJoins, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use tracing::debug;

use crate::access::policy::{AccessPolicy, Role, SENSITIVE_COLUMNS};

pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP",
    "DELETE",
    "TRUNCATE",
    "INSERT",
    "UPDATE",
    "ALTER",
    "CREATE",
    "REPLACE",
    "EXEC",
    "EXECUTE",
    "GRANT",
    "REVOKE",
    "COMMIT",
    "ROLLBACK",
    "SAVEPOINT",
    "TRANSACTION",
    "DECLARE",
    "CURSOR",
    "PROCEDURE",
    "FUNCTION",
    "COPY",
    "CALL",
    "MERGE",
];

/// Set-returning functions that may appear in `FROM`.
pub const TABLE_FUNCTIONS: &[&str] = &[
    "unnest",
    "generate_series",
    "jsonb_array_elements",
    "jsonb_array_elements_text",
    "jsonb_each",
    "jsonb_each_text",
    "jsonb_object_keys",
    "json_array_elements",
    "json_array_elements_text",
    "json_each",
    "json_each_text",
    "json_object_keys",
    "string_to_array",
    "string_to_table",
    "regexp_split_to_table",
];

const BLOCKED_FUNCTION_PREFIXES: &[&str] = &["pg_", "dblink", "lo_"];

const BLOCKED_FUNCTIONS: &[&str] = &[
    "set_config",
    "current_setting",
    "query_to_xml",
    "query_to_xml_and_xmlschema",
    "table_to_xml",
    "schema_to_xml",
    "database_to_xml",
    "cursor_to_xml",
];

static FORBIDDEN_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b({})\b", FORBIDDEN_KEYWORDS.join("|")))
        .expect("forbidden keyword pattern")
});

static SENSITIVE_COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b({})\b", SENSITIVE_COLUMNS.join("|")))
        .expect("sensitive column pattern")
});

static QUALIFIED_WILDCARD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_$]*|"[^"]+")\s*\.\s*\*"#).expect("qualified wildcard pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlValidationError {
    #[error("Query is empty")]
    Empty,

    #[error("Only SELECT queries are allowed")]
    NotSelect,

    #[error("Forbidden SQL operation detected: {0}. Only SELECT queries are allowed.")]
    ForbiddenKeyword(String),

    #[error("Multiple SQL statements are not allowed")]
    MultipleStatements,

    #[error("SQL comments are not allowed")]
    Comment,

    #[error("Access denied to sensitive column: {0}")]
    SensitiveColumn(String),

    #[error("Generated query could not be parsed")]
    Unparseable,

    #[error("Only plain read-only SELECT queries are allowed")]
    UnsupportedStatement,

    #[error("Access denied to table: {0}. Your role does not have permission to query this table.")]
    TableDenied(String),

    #[error("Schema-qualified table references are not allowed: {0}")]
    QualifiedTable(String),

    #[error("Function not allowed in query: {0}")]
    ForbiddenFunction(String),

    #[error("Common table expression may not reuse the table name: {0}")]
    ShadowedTable(String),

    #[error("Access denied to column: {0}")]
    ForbiddenColumn(String),

    #[error("Select columns explicitly instead of expanding every column of {0}")]
    WildcardProjection(String),

    #[error("Unknown table or alias referenced: {0}")]
    PhantomAlias(String),

    #[error("Renaming the columns of table {0} is not allowed")]
    ColumnAliasList(String),
}

/// Validates `sql` for `role` against the process-wide policy.
pub fn validate(sql: &str, role: Role) -> Result<(), SqlValidationError> {
    validate_with_policy(sql, role, AccessPolicy::global())
}

pub fn validate_with_policy(
    sql: &str,
    role: Role,
    policy: &AccessPolicy,
) -> Result<(), SqlValidationError> {
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(SqlValidationError::Empty);
    }

    if !starts_with_select(sql) {
        return Err(SqlValidationError::NotSelect);
    }

    if let Some(m) = FORBIDDEN_KEYWORD_RE.find(sql) {
        return Err(SqlValidationError::ForbiddenKeyword(
            m.as_str().to_ascii_uppercase(),
        ));
    }

    let body = strip_terminator(sql);
    if body.contains(';') {
        return Err(SqlValidationError::MultipleStatements);
    }

    if ["--", "/*", "*/"].iter().any(|marker| sql.contains(marker)) {
        return Err(SqlValidationError::Comment);
    }

    if let Some(m) = SENSITIVE_COLUMN_RE.find(sql) {
        return Err(SqlValidationError::SensitiveColumn(
            m.as_str().to_ascii_lowercase(),
        ));
    }

    let statement = parse_single(body)?;
    check_structure(&statement, body, role, policy)
}

/// Trims the text and drops a single trailing `;`.
pub fn strip_terminator(sql: &str) -> &str {
    let sql = sql.trim();
    sql.strip_suffix(';').map(str::trim_end).unwrap_or(sql)
}

fn starts_with_select(sql: &str) -> bool {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("select"))
}

fn parse_single(sql: &str) -> Result<Statement, SqlValidationError> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| {
        debug!(error = %e, "Generated SQL did not parse");
        SqlValidationError::Unparseable
    })?;

    if statements.len() != 1 {
        return Err(SqlValidationError::MultipleStatements);
    }
    Ok(statements.remove(0))
}

// ────────────────────────────────────────────────────────────────────────────
// Structural checks
// ────────────────────────────────────────────────────────────────────────────

fn check_structure(
    statement: &Statement,
    sql: &str,
    role: Role,
    policy: &AccessPolicy,
) -> Result<(), SqlValidationError> {
    if !matches!(statement, Statement::Query(_)) {
        return Err(SqlValidationError::UnsupportedStatement);
    }

    let mut inventory = QueryInventory::default();
    let _ = statement.visit(&mut inventory);

    if inventory.writes_or_locks {
        return Err(SqlValidationError::UnsupportedStatement);
    }

    if let Some(table) = inventory.renamed_columns.first() {
        return Err(SqlValidationError::ColumnAliasList(table.clone()));
    }

    if let Some(cte) = inventory.ctes.iter().find(|cte| policy.is_known_table(cte)) {
        return Err(SqlValidationError::ShadowedTable(cte.clone()));
    }

    let mut accessed: HashSet<String> = HashSet::new();
    for relation in &inventory.relations {
        let table = match relation.parts.as_deref() {
            Some(_) if relation.is_cte => continue,
            Some([table]) => table,
            Some([schema, table]) if schema == "public" => table,
            _ => {
                return Err(SqlValidationError::QualifiedTable(relation.display.clone()));
            }
        };
        if !policy.can_access(role, table) {
            return Err(SqlValidationError::TableDenied(table.clone()));
        }
        accessed.insert(table.clone());
    }

    if let Some(name) = inventory
        .table_functions
        .iter()
        .find(|name| !TABLE_FUNCTIONS.contains(&name.as_str()))
    {
        return Err(SqlValidationError::ForbiddenFunction(name.clone()));
    }

    if let Some(name) = inventory.functions.iter().find(|name| is_blocked_function(name)) {
        return Err(SqlValidationError::ForbiddenFunction(name.clone()));
    }

    let protected = |qualifier: &str| -> Option<String> {
        inventory.aliases.get(qualifier).and_then(|tables| {
            tables
                .iter()
                .find(|t| accessed.contains(*t))
                .cloned()
        })
    };

    for column in &inventory.columns {
        match &column.qualifier {
            Some(qualifier) => {
                let forbidden = inventory
                    .aliases
                    .get(qualifier)
                    .into_iter()
                    .flatten()
                    .filter(|t| accessed.contains(*t))
                    .any(|t| forbids(policy, role, t, &column.name));
                if forbidden {
                    return Err(SqlValidationError::ForbiddenColumn(column.name.clone()));
                }
            }
            None => {
                // A bare table name or alias is a whole-row reference.
                if let Some(table) = protected(&column.name) {
                    return Err(SqlValidationError::WildcardProjection(table));
                }
                if accessed.iter().any(|t| forbids(policy, role, t, &column.name)) {
                    return Err(SqlValidationError::ForbiddenColumn(column.name.clone()));
                }
            }
        }
    }

    if let Some(table) = inventory
        .wildcard_tables
        .iter()
        .find(|t| accessed.contains(*t))
    {
        return Err(SqlValidationError::WildcardProjection(table.clone()));
    }

    for caps in QUALIFIED_WILDCARD_RE.captures_iter(sql) {
        let qualifier = normalize_text_ident(&caps[1]);
        if !inventory.scope_names.contains(&qualifier) {
            return Err(SqlValidationError::PhantomAlias(qualifier));
        }
        if let Some(table) = protected(&qualifier) {
            return Err(SqlValidationError::WildcardProjection(table));
        }
    }

    if let Some(qualifier) = inventory
        .qualifiers
        .iter()
        .find(|q| !inventory.scope_names.contains(*q))
    {
        return Err(SqlValidationError::PhantomAlias(qualifier.clone()));
    }

    Ok(())
}

fn forbids(policy: &AccessPolicy, role: Role, table: &str, column: &str) -> bool {
    policy
        .lookup(role, table)
        .is_some_and(|entry| entry.forbids_column(column))
}

fn is_blocked_function(name: &str) -> bool {
    BLOCKED_FUNCTION_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
        || BLOCKED_FUNCTIONS.contains(&name)
}

// ────────────────────────────────────────────────────────────────────────────
// AST inventory
// ────────────────────────────────────────────────────────────────────────────

struct Relation {
    /// `None` when a name part is not a plain identifier.
    parts: Option<Vec<String>>,
    display: String,
    /// Resolves to a CTE visible at the point of reference.
    is_cte: bool,
}

/// CTEs declared by one query's WITH clause, in declaration order.
#[derive(Default)]
struct CteFrame {
    names: Vec<String>,
    /// Address of each CTE body, to recognise it when the walk enters it.
    bodies: Vec<*const Query>,
    recursive: bool,
    /// How many of `names` are visible at the current point of the walk.
    visible: usize,
}

impl CteFrame {
    fn enter_body(&mut self, query: &Query) {
        if let Some(index) = self.bodies.iter().position(|b| std::ptr::eq(*b, query)) {
            self.visible = if self.recursive {
                self.names.len()
            } else {
                index
            };
        }
    }

    fn leave_body(&mut self, query: &Query) {
        if self.bodies.iter().any(|b| std::ptr::eq(*b, query)) {
            self.visible = self.names.len();
        }
    }

    fn sees(&self, name: &str) -> bool {
        self.names[..self.visible].iter().any(|n| n == name)
    }
}

struct ColumnRef {
    qualifier: Option<String>,
    name: String,
}

/// Everything the structural checks need, collected in one walk.
#[derive(Default)]
struct QueryInventory {
    relations: Vec<Relation>,
    table_functions: Vec<String>,
    functions: Vec<String>,
    ctes: HashSet<String>,
    cte_scopes: Vec<CteFrame>,
    /// Plain tables given a column alias list (`t AS x(a, b)`).
    renamed_columns: Vec<String>,
    /// Names a column qualifier may legally resolve to.
    scope_names: HashSet<String>,
    /// Qualifier → plain tables it may stand for anywhere in the statement.
    aliases: HashMap<String, HashSet<String>>,
    qualifiers: Vec<String>,
    columns: Vec<ColumnRef>,
    /// Tables expanded by a bare `*` in some projection.
    wildcard_tables: Vec<String>,
    writes_or_locks: bool,
}

impl QueryInventory {
    fn cte_in_scope(&self, name: &str) -> bool {
        self.cte_scopes.iter().any(|frame| frame.sees(name))
    }

    fn introduce(&mut self, alias: &Option<TableAlias>) {
        if let Some(alias) = alias {
            self.scope_names.insert(normalize(&alias.name));
        }
    }

    fn inspect_body(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    self.writes_or_locks = true;
                }
                if select
                    .projection
                    .iter()
                    .any(|item| matches!(item, SelectItem::Wildcard(_)))
                {
                    for from in &select.from {
                        plain_tables(from, &mut self.wildcard_tables);
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.inspect_body(left);
                self.inspect_body(right);
            }
            _ => {}
        }
    }
}

impl Visitor for QueryInventory {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(frame) = self.cte_scopes.last_mut() {
            frame.enter_body(query);
        }

        let mut frame = CteFrame::default();
        if let Some(with) = &query.with {
            frame.recursive = with.recursive;
            for cte in &with.cte_tables {
                let name = normalize(&cte.alias.name);
                self.scope_names.insert(name.clone());
                self.ctes.insert(name.clone());
                frame.names.push(name);
                frame.bodies.push(&*cte.query as *const Query);
            }
            frame.visible = frame.names.len();
        }
        self.cte_scopes.push(frame);

        if !query.locks.is_empty() {
            self.writes_or_locks = true;
        }
        self.inspect_body(&query.body);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.cte_scopes.pop();
        if let Some(frame) = self.cte_scopes.last_mut() {
            frame.leave_body(query);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if args.is_some() {
                    self.table_functions.push(function_name(name));
                    self.introduce(alias);
                } else {
                    let parts = name_parts(name);
                    let is_cte = match parts.as_deref() {
                        Some([single]) => self.cte_in_scope(single),
                        _ => false,
                    };
                    if alias.as_ref().is_some_and(|a| !a.columns.is_empty()) {
                        self.renamed_columns.push(function_name(name));
                    }
                    if let Some(table) = parts.as_ref().and_then(|p| p.last()).cloned() {
                        self.scope_names.insert(table.clone());
                        self.aliases
                            .entry(table.clone())
                            .or_default()
                            .insert(table.clone());
                        if let Some(alias) = alias {
                            let alias = normalize(&alias.name);
                            self.scope_names.insert(alias.clone());
                            self.aliases.entry(alias).or_default().insert(table);
                        }
                    }
                    self.relations.push(Relation {
                        parts,
                        display: name.to_string(),
                        is_cte,
                    });
                }
            }
            TableFactor::Function { name, alias, .. } => {
                self.table_functions.push(function_name(name));
                self.introduce(alias);
            }
            TableFactor::Derived { alias, .. }
            | TableFactor::UNNEST { alias, .. }
            | TableFactor::TableFunction { alias, .. }
            | TableFactor::NestedJoin { alias, .. } => self.introduce(alias),
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push(ColumnRef {
                qualifier: None,
                name: normalize(ident),
            }),
            Expr::CompoundIdentifier(idents) if idents.len() >= 2 => {
                let qualifier = normalize(&idents[idents.len() - 2]);
                self.qualifiers.push(qualifier.clone());
                self.columns.push(ColumnRef {
                    qualifier: Some(qualifier),
                    name: normalize(&idents[idents.len() - 1]),
                });
            }
            Expr::Function(function) => self.functions.push(function_name(&function.name)),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn plain_tables(from: &TableWithJoins, out: &mut Vec<String>) {
    let factors = std::iter::once(&from.relation).chain(from.joins.iter().map(|j| &j.relation));
    for factor in factors {
        match factor {
            TableFactor::Table {
                name, args: None, ..
            } => {
                if let Some(table) = name_parts(name).and_then(|mut p| p.pop()) {
                    out.push(table);
                }
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => plain_tables(table_with_joins, out),
            _ => {}
        }
    }
}

/// Postgres folds unquoted identifiers to lower case.
pub(crate) fn normalize(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

fn normalize_text_ident(text: &str) -> String {
    match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        Some(quoted) => quoted.to_string(),
        None => text.to_lowercase(),
    }
}

pub(crate) fn name_parts(name: &ObjectName) -> Option<Vec<String>> {
    name.0
        .iter()
        .map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(normalize(ident)),
            _ => None,
        })
        .collect()
}

/// Unqualified, lower-cased function name (`pg_catalog.pg_sleep` → `pg_sleep`).
fn function_name(name: &ObjectName) -> String {
    name_parts(name)
        .and_then(|mut parts| parts.pop())
        .unwrap_or_else(|| name.to_string())
        .to_lowercase()
}
