//! Read-only LMS directory collaborator. Upstream payloads are
//! deserialized into typed records at the boundary; anything malformed
//! is an error here instead of a missing-field bug downstream.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("directory service unavailable: {0}")]
    Unavailable(String),
    #[error("malformed directory response: {0}")]
    Malformed(String),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CourseRecord {
    pub id: i64,
    pub name: Option<String>,
    #[serde(default)]
    pub enrollments: Vec<EnrollmentRecord>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AssignmentRecord {
    pub id: i64,
    pub name: Option<String>,
    pub due_at: Option<String>,
    #[serde(default)]
    pub published: bool,
    pub points_possible: Option<f64>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EnrollmentRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub enrollment_state: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub enrollments: Vec<EnrollmentRecord>,
}

impl UserRecord {
    pub fn has_active_student_enrollment(&self) -> bool {
        self.enrollments.iter().any(|e| {
            e.kind == "StudentEnrollment" && e.enrollment_state.as_deref() == Some("active")
        })
    }
}

/// Matching is by email, case-insensitive, requiring an active student
/// enrollment.
pub fn enrollment_contains(users: &[UserRecord], email: &str) -> bool {
    users.iter().any(|u| {
        u.email
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case(email))
            && u.has_active_student_enrollment()
    })
}

#[allow(async_fn_in_trait)]
pub trait LmsDirectory {
    async fn list_courses(&self) -> Result<Vec<CourseRecord>, DirectoryError>;
    async fn list_assignments(
        &self,
        course_id: &str,
    ) -> Result<Vec<AssignmentRecord>, DirectoryError>;
    async fn is_student_enrolled(
        &self,
        course_id: &str,
        email: &str,
    ) -> Result<bool, DirectoryError>;
    async fn list_students(&self, course_id: &str) -> Result<Vec<UserRecord>, DirectoryError>;
}

/// HTTP implementation against the LMS REST API. Carried in request
/// state; credentials are fixed at startup rather than swapped on a
/// shared global.
#[derive(Clone)]
pub struct HttpDirectory {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpDirectory {
    pub fn new(http: reqwest::Client, base_url: String, token: String) -> Self {
        Self { http, base_url, token }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, DirectoryError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| DirectoryError::Malformed(e.to_string()))
    }
}

impl LmsDirectory for HttpDirectory {
    async fn list_courses(&self) -> Result<Vec<CourseRecord>, DirectoryError> {
        let courses: Vec<CourseRecord> = self.get_json("/users/self/favorites/courses").await?;
        Ok(courses
            .into_iter()
            .filter(|c| c.enrollments.iter().any(|e| e.kind == "teacher"))
            .collect())
    }

    async fn list_assignments(
        &self,
        course_id: &str,
    ) -> Result<Vec<AssignmentRecord>, DirectoryError> {
        self.get_json(&format!("/courses/{course_id}/assignments")).await
    }

    async fn is_student_enrolled(
        &self,
        course_id: &str,
        email: &str,
    ) -> Result<bool, DirectoryError> {
        let users: Vec<UserRecord> = self
            .get_json(&format!(
                "/courses/{course_id}/users?include[]=enrollments&per_page=200"
            ))
            .await?;
        Ok(enrollment_contains(&users, email))
    }

    async fn list_students(&self, course_id: &str) -> Result<Vec<UserRecord>, DirectoryError> {
        let users: Vec<UserRecord> = self
            .get_json(&format!(
                "/courses/{course_id}/users?include[]=enrollments&per_page=200"
            ))
            .await?;
        Ok(users
            .into_iter()
            .filter(UserRecord::has_active_student_enrollment)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(email: &str, kind: &str, state: &str) -> UserRecord {
        UserRecord {
            id: 1,
            name: None,
            email: Some(email.into()),
            enrollments: vec![EnrollmentRecord {
                kind: kind.into(),
                enrollment_state: Some(state.into()),
            }],
        }
    }

    #[test]
    fn enrollment_requires_active_student_role() {
        let users = vec![
            user("a@x.com", "StudentEnrollment", "active"),
            user("b@x.com", "StudentEnrollment", "invited"),
            user("c@x.com", "TeacherEnrollment", "active"),
        ];
        assert!(enrollment_contains(&users, "a@x.com"));
        assert!(!enrollment_contains(&users, "b@x.com"));
        assert!(!enrollment_contains(&users, "c@x.com"));
        assert!(!enrollment_contains(&users, "nobody@x.com"));
    }

    #[test]
    fn email_match_is_case_insensitive() {
        let users = vec![user("Student@X.com", "StudentEnrollment", "active")];
        assert!(enrollment_contains(&users, "student@x.com"));
    }

    #[test]
    fn upstream_records_parse_with_missing_optionals() {
        let raw = serde_json::json!([
            { "id": 7, "name": "Alice", "email": "alice@x.com",
              "enrollments": [{ "type": "StudentEnrollment", "enrollment_state": "active" }] },
            { "id": 8 }
        ]);
        let users: Vec<UserRecord> = serde_json::from_value(raw).unwrap();
        assert_eq!(users.len(), 2);
        assert!(users[0].has_active_student_enrollment());
        assert!(!users[1].has_active_student_enrollment());
    }
}
