//! Per-student exercise attempt tracking. One evolving row per open
//! (student, course, exercise) attempt; completed rows are history and a
//! later access starts a fresh row.

use chrono::Utc;
use uuid::Uuid;

use crate::db::Db;
use crate::error::AppError;
use crate::models::ExerciseAttempt;

/// Record an access to an exercise. The partial unique index on open
/// attempts makes this a single atomic statement: a concurrent first
/// access cannot create two open rows.
pub async fn log_attempt(
    db: &Db,
    student_email: &str,
    course_id: &str,
    exercise_id: &str,
) -> Result<ExerciseAttempt, AppError> {
    let attempt = sqlx::query_as::<_, ExerciseAttempt>(
        r#"
        INSERT INTO exercise_attempts (id, student_email, course_id, exercise_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (student_email, course_id, exercise_id) WHERE NOT is_completed
        DO UPDATE SET attempt_count = exercise_attempts.attempt_count + 1
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_email)
    .bind(course_id)
    .bind(exercise_id)
    .fetch_one(db)
    .await?;

    Ok(attempt)
}

/// Mark the most recent attempt for the triple completed with a score.
/// Picks latest by started_at regardless of completion state; with no
/// matching row this is a no-op.
pub async fn complete_attempt(
    db: &Db,
    student_email: &str,
    course_id: &str,
    exercise_id: &str,
    score: Option<f64>,
) -> Result<Option<ExerciseAttempt>, AppError> {
    let attempt = sqlx::query_as::<_, ExerciseAttempt>(
        r#"
        UPDATE exercise_attempts
        SET completed_at = $5, score = $4, is_completed = TRUE
        WHERE id = (
            SELECT id FROM exercise_attempts
            WHERE student_email = $1 AND course_id = $2 AND exercise_id = $3
            ORDER BY started_at DESC
            LIMIT 1
        )
        RETURNING *
        "#,
    )
    .bind(student_email)
    .bind(course_id)
    .bind(exercise_id)
    .bind(score)
    .bind(Utc::now())
    .fetch_optional(db)
    .await?;

    if attempt.is_none() {
        tracing::warn!(
            student_email,
            course_id,
            exercise_id,
            "completion reported for a triple with no attempts"
        );
    }

    Ok(attempt)
}

/// Read-only projection for progress views, latest first.
pub async fn list_attempts(
    db: &Db,
    student_email: &str,
    course_id: Option<&str>,
) -> Result<Vec<ExerciseAttempt>, AppError> {
    let attempts = match course_id {
        Some(course_id) => {
            sqlx::query_as::<_, ExerciseAttempt>(
                r#"
                SELECT * FROM exercise_attempts
                WHERE student_email = $1 AND course_id = $2
                ORDER BY started_at DESC
                "#,
            )
            .bind(student_email)
            .bind(course_id)
            .fetch_all(db)
            .await?
        }
        None => {
            sqlx::query_as::<_, ExerciseAttempt>(
                r#"
                SELECT * FROM exercise_attempts
                WHERE student_email = $1
                ORDER BY started_at DESC
                "#,
            )
            .bind(student_email)
            .fetch_all(db)
            .await?
        }
    };

    Ok(attempts)
}

// Run with `cargo test -- --ignored` against a disposable database.
#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    async fn test_pool() -> Db {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must point at a test database");
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .expect("connect to test database");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrations");
        pool
    }

    fn unique_email() -> String {
        format!("{}@example.com", Uuid::new_v4())
    }

    #[tokio::test]
    #[ignore = "needs a Postgres test database via DATABASE_URL"]
    async fn repeated_access_increments_the_open_row() {
        let db = test_pool().await;
        let email = unique_email();

        let first = log_attempt(&db, &email, "101", "5").await.unwrap();
        assert_eq!(first.attempt_count, 1);
        assert!(!first.is_completed);

        let second = log_attempt(&db, &email, "101", "5").await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt_count, 2);
        assert!(!second.is_completed);
    }

    #[tokio::test]
    #[ignore = "needs a Postgres test database via DATABASE_URL"]
    async fn completion_closes_the_row_and_next_access_opens_a_fresh_one() {
        let db = test_pool().await;
        let email = unique_email();

        log_attempt(&db, &email, "101", "5").await.unwrap();
        let open = log_attempt(&db, &email, "101", "5").await.unwrap();
        assert_eq!(open.attempt_count, 2);

        let done = complete_attempt(&db, &email, "101", "5", Some(80.0))
            .await
            .unwrap()
            .expect("open attempt completes");
        assert_eq!(done.id, open.id);
        assert!(done.is_completed);
        assert_eq!(done.score, Some(80.0));
        assert_eq!(done.attempt_count, 2);
        assert!(done.completed_at.is_some());

        let fresh = log_attempt(&db, &email, "101", "5").await.unwrap();
        assert_ne!(fresh.id, done.id);
        assert_eq!(fresh.attempt_count, 1);
        assert!(!fresh.is_completed);
    }

    #[tokio::test]
    #[ignore = "needs a Postgres test database via DATABASE_URL"]
    async fn completion_with_no_prior_attempts_is_a_noop() {
        let db = test_pool().await;
        let res = complete_attempt(&db, &unique_email(), "101", "5", None)
            .await
            .unwrap();
        assert!(res.is_none());
    }

    #[tokio::test]
    #[ignore = "needs a Postgres test database via DATABASE_URL"]
    async fn attempts_are_scoped_per_exercise() {
        let db = test_pool().await;
        let email = unique_email();

        log_attempt(&db, &email, "101", "5").await.unwrap();
        let other = log_attempt(&db, &email, "101", "6").await.unwrap();
        assert_eq!(other.attempt_count, 1);

        let all = list_attempts(&db, &email, Some("101")).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
