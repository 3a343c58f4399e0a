//! Grade passback over the Assignment and Grades Service: resolve the
//! launch session, obtain a platform access token with a signed client
//! assertion, then POST an AGS score document to the line item captured
//! at launch. Failures are reported to the caller, never retried here.

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::Db;
use crate::error::AppError;
use crate::keys::TOOL_KID;
use crate::models::ToolRegistration;
use crate::{lti, session};

const AGS_SCORE_SCOPE: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/score";
const CLIENT_ASSERTION_TYPE: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Bounds are checked before any session lookup.
pub fn validate_score(score: f64) -> Result<(), AppError> {
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(AppError::InvalidScore);
    }
    Ok(())
}

pub async fn send_grade(
    db: &Db,
    http: &reqwest::Client,
    score: f64,
    session_id: &str,
) -> Result<String, AppError> {
    validate_score(score)?;

    let launch = session::get(db, session_id).await?;
    let reg = lti::active_registration(db).await?;

    let lineitem = launch.ags_lineitem.as_deref().ok_or_else(|| {
        AppError::BadRequest("launch did not carry a grading line item".into())
    })?;

    let token = fetch_access_token(http, &reg).await?;

    let now = Utc::now();
    let payload = score_payload(&launch.subject_id, score, now);
    let scores_url = format!("{}/scores", lineitem.trim_end_matches('/'));

    let resp = http
        .post(&scores_url)
        .bearer_auth(&token)
        .header("content-type", "application/vnd.ims.lis.v1.score+json")
        .json(&payload)
        .send()
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("score post failed: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        tracing::warn!(%status, lineitem = %lineitem, "platform rejected score");
        return Err(AppError::BadRequest(format!(
            "platform rejected score ({status})"
        )));
    }

    Ok("Score successfully sent".to_string())
}

async fn fetch_access_token(
    http: &reqwest::Client,
    reg: &ToolRegistration,
) -> Result<String, AppError> {
    let assertion = client_assertion(reg, Utc::now())?;

    let form = [
        ("grant_type", "client_credentials"),
        ("client_assertion_type", CLIENT_ASSERTION_TYPE),
        ("client_assertion", assertion.as_str()),
        ("scope", AGS_SCORE_SCOPE),
    ];

    let resp: TokenResponse = http
        .post(&reg.auth_token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("token request failed: {e}")))?
        .error_for_status()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("token request rejected: {e}")))?
        .json()
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("token response malformed: {e}")))?;

    Ok(resp.access_token)
}

/// RS256 client-credentials assertion signed with the tool's private key.
fn client_assertion(reg: &ToolRegistration, now: DateTime<Utc>) -> Result<String, AppError> {
    let iat = now.timestamp();
    let claims = serde_json::json!({
        "iss": reg.client_id,
        "sub": reg.client_id,
        "aud": reg.auth_token_url,
        "iat": iat,
        "exp": iat + 300,
        "jti": Uuid::new_v4().to_string(),
    });

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(TOOL_KID.to_string());
    let key = EncodingKey::from_rsa_pem(reg.private_key_pem.as_bytes())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("tool key unusable: {e}")))?;

    encode(&header, &claims, &key)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("assertion signing failed: {e}")))
}

fn score_payload(subject_id: &str, score: f64, now: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "userId": subject_id,
        "scoreGiven": score,
        "scoreMaximum": 1.0,
        "activityProgress": "Completed",
        "gradingProgress": "FullyGraded",
        "timestamp": now.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    #[test]
    fn out_of_range_scores_are_rejected() {
        assert!(validate_score(-0.01).is_err());
        assert!(validate_score(1.01).is_err());
        assert!(validate_score(f64::NAN).is_err());
        assert!(validate_score(f64::INFINITY).is_err());
        assert!(validate_score(0.0).is_ok());
        assert!(validate_score(1.0).is_ok());
        assert!(validate_score(0.85).is_ok());
    }

    #[test]
    fn score_payload_is_fully_graded() {
        let now = Utc::now();
        let payload = score_payload("user-42", 0.8, now);
        assert_eq!(payload["userId"], "user-42");
        assert_eq!(payload["scoreGiven"], 0.8);
        assert_eq!(payload["scoreMaximum"], 1.0);
        assert_eq!(payload["activityProgress"], "Completed");
        assert_eq!(payload["gradingProgress"], "FullyGraded");
    }

    #[test]
    fn client_assertion_verifies_with_tool_public_key() {
        let pair = keys::generate_key_pair().unwrap();
        let jwk = keys::public_key_to_jwk(&pair.public_pem).unwrap();
        let reg = ToolRegistration {
            id: Uuid::new_v4(),
            client_id: "client-1".into(),
            deployment_id: "1".into(),
            issuer: "https://platform.example.com".into(),
            auth_login_url: "https://platform.example.com/auth".into(),
            auth_token_url: "https://platform.example.com/token".into(),
            key_set_url: "https://platform.example.com/jwks".into(),
            private_key_pem: pair.private_pem,
            public_key_pem: pair.public_pem,
            public_jwk: jwk,
            tool_name: "t".into(),
            tool_description: "d".into(),
            created_at: Utc::now(),
        };

        let jwt = client_assertion(&reg, Utc::now()).unwrap();
        let key = jsonwebtoken::DecodingKey::from_rsa_pem(reg.public_key_pem.as_bytes()).unwrap();
        let mut validation = jsonwebtoken::Validation::new(Algorithm::RS256);
        validation.set_audience(&[&reg.auth_token_url]);
        let token =
            jsonwebtoken::decode::<serde_json::Value>(&jwt, &key, &validation).unwrap();
        assert_eq!(token.claims["iss"], "client-1");
        assert_eq!(token.claims["sub"], "client-1");
        assert!(token.claims["jti"].as_str().is_some());
    }
}
