//! Launch session store: durable proof that a platform launch validated.
//! Sessions are immutable once created; a new launch mints a new session.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::db::Db;
use crate::error::AppError;
use crate::models::LaunchSession;

/// Fixed at creation; reads past this point behave as not-found.
const SESSION_TTL_HOURS: i64 = 2;

pub async fn create(
    db: &Db,
    subject_id: &str,
    context_id: &str,
    resource_link_id: Option<&str>,
    roles: &[String],
    ags_lineitem: Option<&str>,
) -> Result<String, AppError> {
    let session_id = Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::hours(SESSION_TTL_HOURS);

    sqlx::query(
        r#"
        INSERT INTO lti_sessions
            (session_id, subject_id, context_id, resource_link_id, roles, ags_lineitem, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&session_id)
    .bind(subject_id)
    .bind(context_id)
    .bind(resource_link_id)
    .bind(roles)
    .bind(ags_lineitem)
    .bind(expires_at)
    .execute(db)
    .await?;

    Ok(session_id)
}

/// Lazy expiry: an expired row is deleted on read and reported as a
/// missing session.
pub async fn get(db: &Db, session_id: &str) -> Result<LaunchSession, AppError> {
    let session = sqlx::query_as::<_, LaunchSession>(
        "SELECT * FROM lti_sessions WHERE session_id = $1",
    )
    .bind(session_id)
    .fetch_optional(db)
    .await?
    .ok_or(AppError::Session)?;

    if session.is_expired(Utc::now()) {
        sqlx::query("DELETE FROM lti_sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(db)
            .await?;
        return Err(AppError::Session);
    }

    Ok(session)
}

#[cfg(test)]
mod tests {
    use crate::models::LaunchSession;
    use chrono::{Duration, Utc};

    fn session(expires_in: Duration) -> LaunchSession {
        let now = Utc::now();
        LaunchSession {
            session_id: "s1".into(),
            subject_id: "u1".into(),
            context_id: "101".into(),
            resource_link_id: Some("rl1".into()),
            roles: vec![],
            ags_lineitem: None,
            expires_at: now + expires_in,
            created_at: now,
        }
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let s = session(Duration::hours(2));
        assert!(!s.is_expired(s.created_at));
        assert!(!s.is_expired(s.expires_at));
        assert!(s.is_expired(s.expires_at + Duration::seconds(1)));
    }
}
