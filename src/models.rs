use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct ToolRegistration {
    pub id: Uuid,
    pub client_id: String,
    pub deployment_id: String,
    pub issuer: String,
    pub auth_login_url: String,
    pub auth_token_url: String,
    pub key_set_url: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
    pub public_jwk: serde_json::Value,
    pub tool_name: String,
    pub tool_description: String,
    pub created_at: DateTime<Utc>,
}

impl ToolRegistration {
    /// Public view for API responses; key material stays inside.
    pub fn to_public(&self) -> serde_json::Value {
        serde_json::json!({
            "client_id": self.client_id,
            "deployment_id": self.deployment_id,
            "issuer": self.issuer,
            "auth_login_url": self.auth_login_url,
            "auth_token_url": self.auth_token_url,
            "key_set_url": self.key_set_url,
            "tool_name": self.tool_name,
            "tool_description": self.tool_description,
        })
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct LaunchSession {
    pub session_id: String,
    pub subject_id: String,
    pub context_id: String,
    pub resource_link_id: Option<String>,
    pub roles: Vec<String>,
    pub ags_lineitem: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl LaunchSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct ExerciseAttempt {
    pub id: Uuid,
    pub student_email: String,
    pub course_id: String,
    pub exercise_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub score: Option<f64>,
    pub attempt_count: i32,
    pub is_completed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetupReq {
    pub client_id: String,
    pub deployment_id: String,
    pub issuer: String,
    pub auth_login_url: String,
    pub auth_token_url: String,
    pub key_set_url: String,
    pub tool_name: Option<String>,
    pub tool_description: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompletionWebhookReq {
    pub student_email: String,
    pub exercise_id: String,
    pub course_id: String,
    pub is_correct: bool,
    pub score: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartExerciseReq {
    pub student_email: String,
}
