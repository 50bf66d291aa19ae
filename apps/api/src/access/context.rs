use serde::Serialize;
use sqlx::PgPool;
use tracing::debug;

use crate::access::policy::Role;
use crate::auth::SessionUser;

/// Identity of the caller for one request. Row filters are rendered from
/// these values; nothing here changes after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    pub role: Role,
    pub user_id: String,
    pub student_id: Option<String>,
    pub company_id: Option<String>,
}

impl CallerContext {
    pub fn student(user_id: impl Into<String>, student_id: Option<String>) -> Self {
        Self {
            role: Role::Student,
            user_id: user_id.into(),
            student_id,
            company_id: None,
        }
    }

    pub fn company(user_id: impl Into<String>, company_id: Option<String>) -> Self {
        Self {
            role: Role::Company,
            user_id: user_id.into(),
            student_id: None,
            company_id,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            role: Role::Admin,
            user_id: user_id.into(),
            student_id: None,
            company_id: None,
        }
    }
}

/// Resolves the profile id that belongs to the session user's role.
/// A user who has not created a profile yet gets `None`; filters that need
/// the id will refuse to render.
pub async fn resolve_caller_context(
    pool: &PgPool,
    user: &SessionUser,
) -> Result<CallerContext, sqlx::Error> {
    let context = match user.role {
        Role::Student => {
            let student_id: Option<String> =
                sqlx::query_scalar("SELECT id FROM students WHERE user_id = $1 LIMIT 1")
                    .bind(&user.user_id)
                    .fetch_optional(pool)
                    .await?;
            CallerContext::student(&user.user_id, student_id)
        }
        Role::Company => {
            let company_id: Option<String> =
                sqlx::query_scalar("SELECT id FROM companies WHERE user_id = $1 LIMIT 1")
                    .bind(&user.user_id)
                    .fetch_optional(pool)
                    .await?;
            CallerContext::company(&user.user_id, company_id)
        }
        Role::Admin => CallerContext::admin(&user.user_id),
    };

    debug!(
        role = %context.role,
        has_student_id = context.student_id.is_some(),
        has_company_id = context.company_id.is_some(),
        "Resolved caller context"
    );
    Ok(context)
}
