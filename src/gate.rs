//! Access gate: the policy run before any exercise request is handed to
//! the target app. Checks run in a fixed order and the first failure
//! wins; enrollment and the exercise list are re-checked against the
//! directory on every gated request, never cached.

use crate::directory::LmsDirectory;

/// Identity and pinning state carried by the caller's portal cookies,
/// plus what they are asking for now.
#[derive(Debug, Clone)]
pub struct GateRequest<'a> {
    pub student_email: Option<&'a str>,
    pub pinned_course: Option<&'a str>,
    pub pinned_exercise: Option<&'a str>,
    pub requested_course: &'a str,
    pub requested_exercise: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// All checks passed; forward and log the attempt.
    Allow,
    /// No student identity in the session.
    NoIdentity,
    /// Pinned course/exercise does not match the request exactly.
    PinMismatch,
    /// Directory says the student is not actively enrolled.
    NotEnrolled,
    /// The exercise is not in the course's current assignment list.
    UnknownExercise,
    /// The directory could not answer. Distinct from a denial: an
    /// outage must not read as "not enrolled".
    DirectoryUnavailable,
}

pub async fn check_access<D: LmsDirectory>(dir: &D, req: &GateRequest<'_>) -> GateDecision {
    let email = match req.student_email {
        Some(email) if !email.is_empty() => email,
        _ => return GateDecision::NoIdentity,
    };

    // exact string equality against the pinned pair
    let pinned = (req.pinned_course, req.pinned_exercise);
    match pinned {
        (Some(course), Some(exercise))
            if course == req.requested_course && exercise == req.requested_exercise => {}
        _ => return GateDecision::PinMismatch,
    }

    match dir.is_student_enrolled(req.requested_course, email).await {
        Ok(true) => {}
        Ok(false) => return GateDecision::NotEnrolled,
        Err(e) => {
            tracing::warn!(error = %e, course = req.requested_course, "enrollment check failed");
            return GateDecision::DirectoryUnavailable;
        }
    }

    let assignments = match dir.list_assignments(req.requested_course).await {
        Ok(assignments) => assignments,
        Err(e) => {
            tracing::warn!(error = %e, course = req.requested_course, "assignment lookup failed");
            return GateDecision::DirectoryUnavailable;
        }
    };

    let known = assignments
        .iter()
        .any(|a| a.id.to_string() == req.requested_exercise);
    if !known {
        return GateDecision::UnknownExercise;
    }

    GateDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{AssignmentRecord, CourseRecord, DirectoryError, UserRecord};

    struct StubDirectory {
        enrolled: Result<bool, ()>,
        assignments: Result<Vec<i64>, ()>,
    }

    impl LmsDirectory for StubDirectory {
        async fn list_courses(&self) -> Result<Vec<CourseRecord>, DirectoryError> {
            Ok(vec![])
        }

        async fn list_assignments(
            &self,
            _course_id: &str,
        ) -> Result<Vec<AssignmentRecord>, DirectoryError> {
            match &self.assignments {
                Ok(ids) => Ok(ids
                    .iter()
                    .map(|id| AssignmentRecord {
                        id: *id,
                        name: None,
                        due_at: None,
                        published: true,
                        points_possible: None,
                    })
                    .collect()),
                Err(()) => Err(DirectoryError::Unavailable("down".into())),
            }
        }

        async fn is_student_enrolled(
            &self,
            _course_id: &str,
            _email: &str,
        ) -> Result<bool, DirectoryError> {
            self.enrolled
                .map_err(|()| DirectoryError::Unavailable("down".into()))
        }

        async fn list_students(
            &self,
            _course_id: &str,
        ) -> Result<Vec<UserRecord>, DirectoryError> {
            Ok(vec![])
        }
    }

    fn request<'a>() -> GateRequest<'a> {
        GateRequest {
            student_email: Some("a@x.com"),
            pinned_course: Some("101"),
            pinned_exercise: Some("5"),
            requested_course: "101",
            requested_exercise: "5",
        }
    }

    #[tokio::test]
    async fn passes_when_all_checks_hold() {
        let dir = StubDirectory { enrolled: Ok(true), assignments: Ok(vec![5]) };
        assert_eq!(check_access(&dir, &request()).await, GateDecision::Allow);
    }

    #[tokio::test]
    async fn missing_identity_denies_first() {
        let dir = StubDirectory { enrolled: Ok(true), assignments: Ok(vec![5]) };
        let mut req = request();
        req.student_email = None;
        assert_eq!(check_access(&dir, &req).await, GateDecision::NoIdentity);
    }

    #[tokio::test]
    async fn pin_mismatch_denies_even_with_valid_enrollment() {
        let dir = StubDirectory { enrolled: Ok(true), assignments: Ok(vec![5, 6]) };
        let mut req = request();
        req.pinned_exercise = Some("6");
        assert_eq!(check_access(&dir, &req).await, GateDecision::PinMismatch);

        let mut req = request();
        req.pinned_course = None;
        assert_eq!(check_access(&dir, &req).await, GateDecision::PinMismatch);
    }

    #[tokio::test]
    async fn not_enrolled_is_a_denial() {
        let dir = StubDirectory { enrolled: Ok(false), assignments: Ok(vec![5]) };
        assert_eq!(check_access(&dir, &request()).await, GateDecision::NotEnrolled);
    }

    #[tokio::test]
    async fn directory_outage_is_not_a_denial() {
        let dir = StubDirectory { enrolled: Err(()), assignments: Ok(vec![5]) };
        assert_eq!(
            check_access(&dir, &request()).await,
            GateDecision::DirectoryUnavailable
        );

        let dir = StubDirectory { enrolled: Ok(true), assignments: Err(()) };
        assert_eq!(
            check_access(&dir, &request()).await,
            GateDecision::DirectoryUnavailable
        );
    }

    #[tokio::test]
    async fn unknown_exercise_is_denied() {
        let dir = StubDirectory { enrolled: Ok(true), assignments: Ok(vec![6, 7]) };
        assert_eq!(
            check_access(&dir, &request()).await,
            GateDecision::UnknownExercise
        );
    }
}
