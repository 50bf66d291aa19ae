//! Row-level filter injection.
//!
//! Every SELECT scope that reads a policy table with a row filter gets that
//! filter ANDed into its `WHERE` clause. Runs only on SQL that already passed
//! validation.

use std::ops::ControlFlow;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    BinaryOperator, Expr, Query, Select, SetExpr, TableFactor, TableWithJoins, VisitMut,
    VisitorMut,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::{Parser, ParserError};
use thiserror::Error;
use tracing::debug;

use crate::access::context::CallerContext;
use crate::access::policy::AccessPolicy;
use crate::query::validator::name_parts;

pub const USER_ID_PLACEHOLDER: &str = ":currentUserId";
pub const STUDENT_ID_PLACEHOLDER: &str = ":currentStudentId";
pub const COMPANY_ID_PLACEHOLDER: &str = ":currentCompanyId";

static QUALIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([a-z_][a-z0-9_]*)\.").expect("qualifier pattern"));

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Failed to parse SQL for row filtering: {0}")]
    Parse(#[from] ParserError),

    #[error("Expected exactly one statement, found {0}")]
    StatementCount(usize),

    /// The template needs an id the caller does not have (e.g. no profile yet).
    #[error("Caller identity for {0} is not available")]
    MissingIdentity(&'static str),
}

/// Returns `sql` with the role's row filters applied to every scope.
pub fn add_role_based_filters(sql: &str, ctx: &CallerContext) -> Result<String, FilterError> {
    add_role_based_filters_with_policy(sql, ctx, AccessPolicy::global())
}

pub fn add_role_based_filters_with_policy(
    sql: &str,
    ctx: &CallerContext,
    policy: &AccessPolicy,
) -> Result<String, FilterError> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)?;
    if statements.len() != 1 {
        return Err(FilterError::StatementCount(statements.len()));
    }

    let mut injector = FilterInjector {
        ctx,
        policy,
        injected: 0,
    };
    if let ControlFlow::Break(err) = statements[0].visit(&mut injector) {
        return Err(err);
    }

    debug!(
        role = %ctx.role,
        conditions = injector.injected,
        "Applied row-level filters"
    );
    Ok(statements[0].to_string())
}

struct FilterInjector<'a> {
    ctx: &'a CallerContext,
    policy: &'a AccessPolicy,
    injected: usize,
}

/// A policy table read directly by one scope.
struct ScopedTable {
    table: String,
    /// Alias as written in the query, quoting preserved.
    alias: Option<String>,
}

impl VisitorMut for FilterInjector<'_> {
    type Break = FilterError;

    // Nested queries are visited on their own, so each scope is filtered once.
    fn post_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        match self.filter_body(query.body.as_mut()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }
}

impl FilterInjector<'_> {
    fn filter_body(&mut self, body: &mut SetExpr) -> Result<(), FilterError> {
        match body {
            SetExpr::Select(select) => self.filter_select(select),
            SetExpr::SetOperation { left, right, .. } => {
                self.filter_body(left)?;
                self.filter_body(right)
            }
            _ => Ok(()),
        }
    }

    fn filter_select(&mut self, select: &mut Select) -> Result<(), FilterError> {
        let mut tables = Vec::new();
        for from in &select.from {
            scoped_tables(from, &mut tables);
        }

        let mut conditions = Vec::new();
        for scoped in &tables {
            let Some(template) = self.policy.row_filter(self.ctx.role, &scoped.table) else {
                continue;
            };
            let condition = render_condition(template, scoped, self.ctx)?;
            let expr = Parser::new(&PostgreSqlDialect {})
                .try_with_sql(&condition)?
                .parse_expr()?;
            conditions.push(Expr::Nested(Box::new(expr)));
        }

        let Some(filter) = conditions.into_iter().reduce(and) else {
            return Ok(());
        };
        self.injected += 1;
        select.selection = Some(match select.selection.take() {
            Some(existing) => and(filter, Expr::Nested(Box::new(existing))),
            None => filter,
        });
        Ok(())
    }
}

fn and(left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOperator::And,
        right: Box::new(right),
    }
}

fn scoped_tables(from: &TableWithJoins, out: &mut Vec<ScopedTable>) {
    let factors = std::iter::once(&from.relation).chain(from.joins.iter().map(|j| &j.relation));
    for factor in factors {
        match factor {
            TableFactor::Table {
                name,
                alias,
                args: None,
                ..
            } => {
                let table = match name_parts(name).as_deref() {
                    Some([table]) => table.clone(),
                    Some([schema, table]) if schema == "public" => table.clone(),
                    _ => continue,
                };
                out.push(ScopedTable {
                    table,
                    alias: alias.as_ref().map(|a| a.name.to_string()),
                });
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => scoped_tables(table_with_joins, out),
            _ => {}
        }
    }
}

/// Points the table qualifier at the alias the query uses, then fills
/// placeholders with quoted literals.
fn render_condition(
    template: &str,
    scoped: &ScopedTable,
    ctx: &CallerContext,
) -> Result<String, FilterError> {
    let mut condition = template.to_string();

    if let Some(alias) = &scoped.alias {
        condition = QUALIFIER_RE
            .replace_all(&condition, |caps: &regex::Captures| {
                if caps[1] == scoped.table {
                    format!("{alias}.")
                } else {
                    caps[0].to_string()
                }
            })
            .into_owned();
    }

    let values = [
        (USER_ID_PLACEHOLDER, Some(ctx.user_id.as_str())),
        (STUDENT_ID_PLACEHOLDER, ctx.student_id.as_deref()),
        (COMPANY_ID_PLACEHOLDER, ctx.company_id.as_deref()),
    ];
    for (placeholder, value) in values {
        if condition.contains(placeholder) {
            let value = value
                .filter(|v| !v.is_empty())
                .ok_or(FilterError::MissingIdentity(placeholder))?;
            condition = condition.replace(placeholder, &quote_literal(value));
        }
    }

    Ok(condition)
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
