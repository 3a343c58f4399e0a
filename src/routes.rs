use axum::{
    extract::{Path, Query, State},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use axum::http::StatusCode;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::Db;
use crate::directory::{HttpDirectory, LmsDirectory};
use crate::error::AppError;
use crate::gate::{self, GateDecision, GateRequest};
use crate::models::*;
use crate::{attempts, flag, grade, lti, session};

const SESSION_COOKIE: &str = "lti_session_id";
const STUDENT_COOKIE: &str = "portal_student";
const PINNED_COURSE_COOKIE: &str = "portal_course";
const PINNED_EXERCISE_COOKIE: &str = "portal_exercise";

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub cfg: Arc<AppConfig>,
    pub http: reqwest::Client,
    pub directory: HttpDirectory,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // LTI tool surface
        .route("/lti/config", get(lti_config))
        .route("/lti/jwks", get(lti_jwks))
        .route("/lti/setup", get(lti_setup_view).post(lti_setup))
        .route("/lti/login", post(lti_login))
        .route("/lti/launch", post(lti_launch))
        .route("/lti/deep_linking", post(lti_deep_linking))
        .route("/lti/deep_linking/response", post(lti_deep_linking_response))
        .route("/lti/submit_score", post(submit_score))
        // flag + completion callbacks from the target app
        .route("/api/flags/verify", post(verify_flag))
        .route("/api/webhook/completion", post(completion_webhook))
        // gated exercise access
        .route("/exercise/:course_id/:exercise_id/start", post(start_exercise))
        .route("/exercise/:course_id/:exercise_id/launch", get(launch_exercise))
        // read-only directory views for the admin screens
        .route("/api/courses", get(api_courses))
        .route("/api/courses/:course_id/exercises", get(api_course_exercises))
        .route("/api/courses/:course_id/students", get(api_course_students))
        // progress projection
        .route("/api/attempts/:student_email", get(list_attempts))
        .with_state(state)
}

// --- tool metadata ---

async fn lti_config(State(st): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let reg = lti::active_registration(&st.db).await?;
    Ok(Json(lti::tool_configuration(&reg, &st.cfg)))
}

async fn lti_jwks(State(st): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let reg = lti::active_registration(&st.db).await.ok();
    Ok(Json(lti::jwks_document(reg.as_ref())))
}

async fn lti_setup_view(State(st): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let reg = lti::active_registration(&st.db).await?;
    Ok(Json(reg.to_public()))
}

async fn lti_setup(
    State(st): State<AppState>,
    Json(req): Json<SetupReq>,
) -> Result<Json<serde_json::Value>, AppError> {
    let reg = lti::upsert_registration(&st.db, &req).await?;
    tracing::info!(client_id = %reg.client_id, "tool registration updated");
    Ok(Json(reg.to_public()))
}

// --- launch flow ---

async fn lti_login(
    State(st): State<AppState>,
    Form(params): Form<lti::LoginInitParams>,
) -> Result<Redirect, AppError> {
    let reg = lti::active_registration(&st.db).await?;
    if params.iss != reg.issuer {
        return Err(AppError::Validation("unknown platform issuer".into()));
    }
    if let Some(client_id) = &params.client_id {
        if client_id != &reg.client_id {
            return Err(AppError::Validation("client_id mismatch".into()));
        }
    }
    let url = lti::build_login_redirect(&reg, &st.cfg, &params);
    Ok(Redirect::to(&url))
}

#[derive(Deserialize, Debug)]
struct LaunchForm {
    id_token: String,
    #[allow(dead_code)]
    state: Option<String>,
}

async fn lti_launch(
    State(st): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LaunchForm>,
) -> Result<Response, AppError> {
    let launch = lti::validate_launch(&st.db, &st.http, &form.id_token).await?;

    let jar = jar.add(session_cookie(SESSION_COOKIE, launch.session_id.clone()));

    let is_instructor = lti::has_instructor_role(&launch.roles);
    let target = if is_instructor {
        "/dashboard".to_string()
    } else {
        st.cfg.target_app_url.clone()
    };

    tracing::info!(
        subject = %launch.subject_id,
        context = %launch.context_id,
        instructor = is_instructor,
        "LTI launch validated"
    );
    Ok((jar, Redirect::to(&target)).into_response())
}

async fn lti_deep_linking(
    State(st): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LaunchForm>,
) -> Result<Response, AppError> {
    let launch = lti::validate_launch(&st.db, &st.http, &form.id_token).await?;

    let settings = launch
        .deep_linking
        .as_ref()
        .ok_or_else(|| AppError::Validation("missing deep linking settings".into()))?;

    // assignment list for the selection page; read path, degrades to empty
    let assignments = match st.directory.list_assignments(&launch.context_id).await {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!(error = %e, "assignment list unavailable for selection page");
            vec![]
        }
    };

    let options = assignments
        .iter()
        .map(|a| {
            format!(
                "<option value='{}'>{}</option>",
                a.id,
                escape_attr(a.name.as_deref().unwrap_or("(untitled)"))
            )
        })
        .collect::<String>();

    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset='utf-8'/><title>Select an exercise</title></head>
<body>
<h1>Select an exercise</h1>
<form method='post' action='/lti/deep_linking/response'>
  <input type='hidden' name='return_url' value='{return_url}'/>
  <input type='hidden' name='data' value='{data}'/>
  <label>Exercise <select name='exercise_id'>{options}</select></label>
  <input type='text' name='title' placeholder='Title'/>
  <button type='submit'>Add to course</button>
</form>
</body>
</html>"#,
        return_url = escape_attr(&settings.deep_link_return_url),
        data = escape_attr(settings.data.as_deref().unwrap_or("")),
        options = options,
    );

    let jar = jar.add(session_cookie(SESSION_COOKIE, launch.session_id.clone()));
    Ok((jar, Html(html)).into_response())
}

#[derive(Deserialize, Debug)]
struct DeepLinkSelection {
    return_url: String,
    data: Option<String>,
    exercise_id: String,
    title: Option<String>,
}

async fn lti_deep_linking_response(
    State(st): State<AppState>,
    jar: CookieJar,
    Form(sel): Form<DeepLinkSelection>,
) -> Result<Html<String>, AppError> {
    // only a validated instructor launch may obtain a signed response
    let session_id = jar
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or(AppError::Session)?;
    let launch = session::get(&st.db, &session_id).await?;
    ensure_instructor(&launch)?;

    let reg = lti::active_registration(&st.db).await?;

    let items = [lti::ContentItem {
        title: sel.title.clone().unwrap_or_else(|| format!("Exercise {}", sel.exercise_id)),
        exercise_id: sel.exercise_id.clone(),
    }];
    let data = sel.data.as_deref().filter(|d| !d.is_empty());
    let jwt = lti::build_deep_link_response(&reg, &st.cfg, &items, data)?;

    // auto-submitting form posts the signed response back to the platform
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<body onload='document.forms[0].submit()'>
<form method='post' action='{return_url}'>
  <input type='hidden' name='JWT' value='{jwt}'/>
  <noscript><button type='submit'>Continue</button></noscript>
</form>
</body>
</html>"#,
        return_url = escape_attr(&sel.return_url),
        jwt = jwt,
    );
    Ok(Html(html))
}

// --- grading ---

async fn submit_score(
    State(st): State<AppState>,
    jar: CookieJar,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let score = body
        .get("score")
        .and_then(|v| v.as_f64())
        .ok_or(AppError::InvalidScore)?;
    grade::validate_score(score)?;

    let session_id = jar
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or(AppError::Session)?;

    let message = grade::send_grade(&st.db, &st.http, score, &session_id).await?;
    Ok(Json(serde_json::json!({ "message": message })))
}

// --- flags + completion ---

async fn verify_flag(
    State(st): State<AppState>,
    jar: CookieJar,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, AppError> {
    let submitted = body
        .get("flag")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::BadRequest("flag and challenge are required".into()))?;
    let challenge = body
        .get("challenge")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::BadRequest("flag and challenge are required".into()))?;

    // bind to the launch context when a session is present
    let launch = match jar.get(SESSION_COOKIE) {
        Some(c) => session::get(&st.db, c.value()).await.ok(),
        None => None,
    };
    let user = launch.as_ref().map(|l| l.subject_id.as_str());
    let course = launch.as_ref().map(|l| l.context_id.as_str());

    if flag::verify_flag(&st.cfg.flag_key, submitted, challenge, user, course) {
        Ok(Json(serde_json::json!({
            "success": true,
            "message": "Congratulations! Flag is correct.",
            "completion": { "challenge": challenge, "status": "complete" }
        }))
        .into_response())
    } else {
        Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "message": "Incorrect flag. Try again!"
            })),
        )
            .into_response())
    }
}

async fn completion_webhook(
    State(st): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req: CompletionWebhookReq = serde_json::from_value(body)
        .map_err(|e| AppError::BadRequest(format!("invalid completion payload: {e}")))?;

    if !req.is_correct {
        return Ok(Json(serde_json::json!({ "updated": false })));
    }

    let updated = attempts::complete_attempt(
        &st.db,
        &req.student_email,
        &req.course_id,
        &req.exercise_id,
        req.score,
    )
    .await?;

    Ok(Json(serde_json::json!({
        "updated": updated.is_some(),
        "attempt": updated,
    })))
}

// --- gated exercise access ---

async fn start_exercise(
    State(st): State<AppState>,
    jar: CookieJar,
    Path((course_id, exercise_id)): Path<(String, String)>,
    Json(req): Json<StartExerciseReq>,
) -> Result<Response, AppError> {
    if req.student_email.is_empty() {
        return Err(AppError::BadRequest("student_email is required".into()));
    }

    // early feedback at pin time; the gate re-checks both on every launch
    let enrolled = st
        .directory
        .is_student_enrolled(&course_id, &req.student_email)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, course_id, "enrollment check failed");
            AppError::Unavailable
        })?;
    if !enrolled {
        return Err(AppError::Enrollment);
    }

    let assignments = st
        .directory
        .list_assignments(&course_id)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, course_id, "assignment lookup failed");
            AppError::Unavailable
        })?;
    if !assignments.iter().any(|a| a.id.to_string() == exercise_id) {
        return Err(AppError::NotFound("exercise"));
    }

    // pin the course/exercise pair for the gate to re-check on launch
    let jar = jar
        .add(session_cookie(STUDENT_COOKIE, req.student_email.clone()))
        .add(session_cookie(PINNED_COURSE_COOKIE, course_id.clone()))
        .add(session_cookie(PINNED_EXERCISE_COOKIE, exercise_id.clone()));

    Ok((jar, Json(serde_json::json!({ "pinned": true }))).into_response())
}

async fn launch_exercise(
    State(st): State<AppState>,
    jar: CookieJar,
    Path((course_id, exercise_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let student = jar.get(STUDENT_COOKIE).map(|c| c.value().to_string());
    let pinned_course = jar.get(PINNED_COURSE_COOKIE).map(|c| c.value().to_string());
    let pinned_exercise = jar.get(PINNED_EXERCISE_COOKIE).map(|c| c.value().to_string());

    let req = GateRequest {
        student_email: student.as_deref(),
        pinned_course: pinned_course.as_deref(),
        pinned_exercise: pinned_exercise.as_deref(),
        requested_course: &course_id,
        requested_exercise: &exercise_id,
    };

    match gate::check_access(&st.directory, &req).await {
        GateDecision::Allow => {}
        GateDecision::DirectoryUnavailable => {
            return Ok((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "enrollment service unavailable" })),
            )
                .into_response());
        }
        decision => {
            tracing::info!(?decision, course_id, exercise_id, "gated access denied");
            return Ok(Redirect::to("/").into_response());
        }
    }

    let email = student.unwrap_or_default();
    let attempt = attempts::log_attempt(&st.db, &email, &course_id, &exercise_id).await?;
    tracing::info!(
        student = %email,
        course_id,
        exercise_id,
        attempt_count = attempt.attempt_count,
        "exercise access logged"
    );

    // tracking cookies let the target app correlate the completion callback
    let jar = jar
        .add(session_cookie("exercise_id", exercise_id.clone()))
        .add(session_cookie("student_email", email))
        .add(session_cookie("course_id", course_id.clone()));

    Ok((jar, Redirect::to(&st.cfg.target_app_url)).into_response())
}

// --- directory read views ---
// List failures degrade to empty results with a warning; "service down"
// and "no records" look the same on these read paths.

async fn api_courses(State(st): State<AppState>) -> Json<serde_json::Value> {
    let courses = st.directory.list_courses().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "course list unavailable");
        vec![]
    });
    Json(serde_json::json!(courses))
}

async fn api_course_exercises(
    State(st): State<AppState>,
    Path(course_id): Path<String>,
) -> Json<serde_json::Value> {
    let assignments = st
        .directory
        .list_assignments(&course_id)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, course_id, "assignment list unavailable");
            vec![]
        });
    Json(serde_json::json!(assignments))
}

async fn api_course_students(
    State(st): State<AppState>,
    Path(course_id): Path<String>,
) -> Json<serde_json::Value> {
    let students = st
        .directory
        .list_students(&course_id)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, course_id, "student list unavailable");
            vec![]
        });
    Json(serde_json::json!(students))
}

// --- progress ---

#[derive(Deserialize, Debug)]
struct AttemptsQuery {
    course_id: Option<String>,
}

async fn list_attempts(
    State(st): State<AppState>,
    Path(student_email): Path<String>,
    Query(q): Query<AttemptsQuery>,
) -> Result<Json<Vec<ExerciseAttempt>>, AppError> {
    let rows =
        attempts::list_attempts(&st.db, &student_email, q.course_id.as_deref()).await?;
    Ok(Json(rows))
}

// --- helpers ---

fn session_cookie(name: &'static str, value: String) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie
}

fn ensure_instructor(launch: &LaunchSession) -> Result<(), AppError> {
    if lti::has_instructor_role(&launch.roles) {
        Ok(())
    } else {
        Err(AppError::Forbidden("instructor role required"))
    }
}

/// Minimal HTML attribute encoding for values interpolated into the
/// deep-linking pages.
fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn launch_with_roles(roles: Vec<String>) -> LaunchSession {
        let now = Utc::now();
        LaunchSession {
            session_id: "s1".into(),
            subject_id: "u1".into(),
            context_id: "101".into(),
            resource_link_id: None,
            roles,
            ags_lineitem: None,
            expires_at: now + Duration::hours(2),
            created_at: now,
        }
    }

    #[test]
    fn signed_response_requires_an_instructor_session() {
        let instructor = launch_with_roles(vec![
            "http://purl.imsglobal.org/vocab/lis/v2/membership/Instructor".into(),
        ]);
        assert!(ensure_instructor(&instructor).is_ok());

        let learner = launch_with_roles(vec![
            "http://purl.imsglobal.org/vocab/lis/v2/membership/Learner".into(),
        ]);
        assert!(matches!(
            ensure_instructor(&learner),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            ensure_instructor(&launch_with_roles(vec![])),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn attribute_values_cannot_break_out_of_the_form() {
        let hostile = "https://x/'><script>alert(1)</script>";
        let escaped = escape_attr(hostile);
        assert!(!escaped.contains('\''));
        assert!(!escaped.contains('<'));
        assert_eq!(
            escaped,
            "https://x/&#x27;&gt;&lt;script&gt;alert(1)&lt;/script&gt;"
        );
        assert_eq!(escape_attr("plain-url"), "plain-url");
    }
}
