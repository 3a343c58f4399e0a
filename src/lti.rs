//! LTI 1.3 launch handling: tool registration, OIDC initiation, signed
//! launch validation, and the deep-linking response.
//!
//! A launch moves through one validation pipeline: load the active
//! registration, resolve the platform key via its JWKS, verify the
//! id_token (signature, audience, issuer, expiry), enforce single-use
//! nonces, then mint a launch session from the extracted claims. Any
//! failed check aborts the launch; callers surface a generic client
//! error so the platform cannot probe which check tripped.

use chrono::Utc;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::Db;
use crate::error::AppError;
use crate::keys::{self, TOOL_KID};
use crate::models::{SetupReq, ToolRegistration};
use crate::session;

const CLAIM_DEPLOYMENT_ID: &str = "https://purl.imsglobal.org/spec/lti/claim/deployment_id";
const CLAIM_MESSAGE_TYPE: &str = "https://purl.imsglobal.org/spec/lti/claim/message_type";
const CLAIM_VERSION: &str = "https://purl.imsglobal.org/spec/lti/claim/version";
const CLAIM_CONTENT_ITEMS: &str = "https://purl.imsglobal.org/spec/lti-dl/claim/content_items";
const CLAIM_DL_DATA: &str = "https://purl.imsglobal.org/spec/lti-dl/claim/data";

// query-string escaping for the OIDC redirect
const QUERY_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'&')
    .add(b'=')
    .add(b'+')
    .add(b'%')
    .add(b'?');

// ---------------- registration ----------------

/// Exactly one registration is consulted per validation: the most
/// recently created row.
pub async fn active_registration(db: &Db) -> Result<ToolRegistration, AppError> {
    sqlx::query_as::<_, ToolRegistration>(
        "SELECT * FROM lti_registrations ORDER BY created_at DESC LIMIT 1",
    )
    .fetch_optional(db)
    .await?
    .ok_or(AppError::Configuration)
}

/// Setup flow: generate a fresh signing pair and upsert the registration
/// keyed on client_id. Private key never leaves this table.
pub async fn upsert_registration(
    db: &Db,
    req: &SetupReq,
) -> Result<ToolRegistration, AppError> {
    let pair = keys::generate_key_pair().map_err(|e| AppError::Internal(e.into()))?;
    let jwk = keys::public_key_to_jwk(&pair.public_pem)
        .map_err(|e| AppError::Internal(e.into()))?;

    let reg = sqlx::query_as::<_, ToolRegistration>(
        r#"
        INSERT INTO lti_registrations
            (id, client_id, deployment_id, issuer, auth_login_url, auth_token_url,
             key_set_url, private_key_pem, public_key_pem, public_jwk,
             tool_name, tool_description)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                COALESCE($11, 'Exercise Gateway'),
                COALESCE($12, 'Security training platform integration'))
        ON CONFLICT (client_id) DO UPDATE SET
            deployment_id = EXCLUDED.deployment_id,
            issuer = EXCLUDED.issuer,
            auth_login_url = EXCLUDED.auth_login_url,
            auth_token_url = EXCLUDED.auth_token_url,
            key_set_url = EXCLUDED.key_set_url,
            private_key_pem = EXCLUDED.private_key_pem,
            public_key_pem = EXCLUDED.public_key_pem,
            public_jwk = EXCLUDED.public_jwk,
            tool_name = EXCLUDED.tool_name,
            tool_description = EXCLUDED.tool_description
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&req.client_id)
    .bind(&req.deployment_id)
    .bind(&req.issuer)
    .bind(&req.auth_login_url)
    .bind(&req.auth_token_url)
    .bind(&req.key_set_url)
    .bind(&pair.private_pem)
    .bind(&pair.public_pem)
    .bind(&jwk)
    .bind(&req.tool_name)
    .bind(&req.tool_description)
    .fetch_one(db)
    .await?;

    Ok(reg)
}

// ---------------- claims ----------------

#[derive(Deserialize, Debug, Clone)]
pub struct ContextClaim {
    pub id: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ResourceLinkClaim {
    pub id: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AgsEndpointClaim {
    pub lineitem: Option<String>,
    #[serde(default)]
    pub scope: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeepLinkingSettings {
    pub deep_link_return_url: String,
    pub data: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LtiClaims {
    pub sub: String,
    pub nonce: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/context")]
    pub context: Option<ContextClaim>,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/resource_link")]
    pub resource_link: Option<ResourceLinkClaim>,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/roles", default)]
    pub roles: Vec<String>,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/deployment_id")]
    pub deployment_id: Option<String>,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti-ags/claim/endpoint")]
    pub ags_endpoint: Option<AgsEndpointClaim>,
    #[serde(
        rename = "https://purl.imsglobal.org/spec/lti-dl/claim/deep_linking_settings"
    )]
    pub deep_linking: Option<DeepLinkingSettings>,
}

/// Instructor check against the LTI role vocabulary: any role URI
/// ending in "/Instructor" counts.
pub fn has_instructor_role(roles: &[String]) -> bool {
    roles.iter().any(|r| r.ends_with("/Instructor"))
}

/// Claims handed back after a launch validates, alongside the minted
/// session id.
#[derive(Debug, Clone)]
pub struct ValidatedLaunch {
    pub session_id: String,
    pub subject_id: String,
    pub context_id: String,
    pub resource_link_id: Option<String>,
    pub roles: Vec<String>,
    pub deep_linking: Option<DeepLinkingSettings>,
}

// ---------------- validator ----------------

#[derive(Deserialize)]
struct JwksDocument {
    keys: Vec<PlatformJwk>,
}

#[derive(Deserialize)]
struct PlatformJwk {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

pub async fn validate_launch(
    db: &Db,
    http: &reqwest::Client,
    id_token: &str,
) -> Result<ValidatedLaunch, AppError> {
    let reg = active_registration(db).await?;

    let header = decode_header(id_token)
        .map_err(|e| AppError::Validation(format!("bad token header: {e}")))?;

    let decoding_key = resolve_platform_key(http, &reg.key_set_url, header.kid.as_deref())
        .await?;

    let claims = verify_id_token(id_token, &decoding_key, &reg.client_id, &reg.issuer)?;

    consume_nonce(db, &claims.nonce).await?;

    if let Some(deployment_id) = &claims.deployment_id {
        if deployment_id != &reg.deployment_id {
            return Err(AppError::Validation("deployment_id mismatch".into()));
        }
    }

    let context_id = claims
        .context
        .as_ref()
        .map(|c| c.id.clone())
        .ok_or_else(|| AppError::Validation("missing context claim".into()))?;
    let resource_link_id = claims.resource_link.as_ref().map(|r| r.id.clone());
    let ags_lineitem = claims
        .ags_endpoint
        .as_ref()
        .and_then(|e| e.lineitem.as_deref());

    let session_id = session::create(
        db,
        &claims.sub,
        &context_id,
        resource_link_id.as_deref(),
        &claims.roles,
        ags_lineitem,
    )
    .await?;

    Ok(ValidatedLaunch {
        session_id,
        subject_id: claims.sub,
        context_id,
        resource_link_id,
        roles: claims.roles,
        deep_linking: claims.deep_linking,
    })
}

/// Signature, audience, issuer and expiry checks against the resolved
/// platform key. A token failing any of them never reaches the nonce or
/// session steps.
fn verify_id_token(
    id_token: &str,
    key: &DecodingKey,
    client_id: &str,
    issuer: &str,
) -> Result<LtiClaims, AppError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[client_id]);
    validation.set_issuer(&[issuer]);

    let token = decode::<LtiClaims>(id_token, key, &validation)
        .map_err(|e| AppError::Validation(format!("token rejected: {e}")))?;
    Ok(token.claims)
}

async fn resolve_platform_key(
    http: &reqwest::Client,
    key_set_url: &str,
    kid: Option<&str>,
) -> Result<DecodingKey, AppError> {
    let doc: JwksDocument = http
        .get(key_set_url)
        .send()
        .await
        .map_err(|e| AppError::Validation(format!("jwks fetch failed: {e}")))?
        .error_for_status()
        .map_err(|e| AppError::Validation(format!("jwks fetch failed: {e}")))?
        .json()
        .await
        .map_err(|e| AppError::Validation(format!("jwks parse failed: {e}")))?;

    let jwk = doc
        .keys
        .iter()
        .filter(|k| k.kty == "RSA")
        .find(|k| match kid {
            Some(kid) => k.kid.as_deref() == Some(kid),
            None => true,
        })
        .ok_or_else(|| AppError::Validation("no matching platform key".into()))?;

    let (n, e) = match (&jwk.n, &jwk.e) {
        (Some(n), Some(e)) => (n, e),
        _ => return Err(AppError::Validation("platform key missing modulus".into())),
    };

    DecodingKey::from_rsa_components(n, e)
        .map_err(|e| AppError::Validation(format!("bad platform key: {e}")))
}

/// Single-use nonce enforcement: the conditional insert loses exactly
/// when the nonce was already seen.
async fn consume_nonce(db: &Db, nonce: &str) -> Result<(), AppError> {
    let inserted = sqlx::query("INSERT INTO lti_nonces (nonce) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(nonce)
        .execute(db)
        .await?
        .rows_affected();
    if inserted == 0 {
        return Err(AppError::Validation("nonce replay".into()));
    }
    Ok(())
}

// ---------------- OIDC initiation ----------------

#[derive(Deserialize, Debug, Clone)]
pub struct LoginInitParams {
    pub iss: String,
    pub login_hint: String,
    pub lti_message_hint: Option<String>,
    pub client_id: Option<String>,
}

/// Build the browser redirect back to the platform's authorization
/// endpoint, carrying the original parameters plus a fresh state/nonce.
pub fn build_login_redirect(
    reg: &ToolRegistration,
    cfg: &AppConfig,
    params: &LoginInitParams,
) -> String {
    let state = Uuid::new_v4().to_string();
    let nonce = Uuid::new_v4().to_string();

    let mut query = vec![
        ("scope", "openid".to_string()),
        ("response_type", "id_token".to_string()),
        ("response_mode", "form_post".to_string()),
        ("prompt", "none".to_string()),
        ("client_id", reg.client_id.clone()),
        ("redirect_uri", cfg.launch_url()),
        ("login_hint", params.login_hint.clone()),
        ("state", state),
        ("nonce", nonce),
    ];
    if let Some(hint) = &params.lti_message_hint {
        query.push(("lti_message_hint", hint.clone()));
    }

    let encoded = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, utf8_percent_encode(v, QUERY_ENCODE)))
        .collect::<Vec<_>>()
        .join("&");

    let sep = if reg.auth_login_url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", reg.auth_login_url, sep, encoded)
}

// ---------------- tool metadata ----------------

/// Configuration document the platform consumes at registration time.
pub fn tool_configuration(reg: &ToolRegistration, cfg: &AppConfig) -> serde_json::Value {
    serde_json::json!({
        "title": reg.tool_name,
        "description": reg.tool_description,
        "oidc_initiation_url": cfg.oidc_initiation_url(),
        "target_link_uri": cfg.launch_url(),
        "scopes": [
            "https://purl.imsglobal.org/spec/lti-ags/scope/lineitem",
            "https://purl.imsglobal.org/spec/lti-ags/scope/result.readonly",
            "https://purl.imsglobal.org/spec/lti-ags/scope/score",
            "https://purl.imsglobal.org/spec/lti-nrps/scope/contextmembership.readonly"
        ],
        "extensions": [
            {
                "platform": "canvas.instructure.com",
                "settings": {
                    "platform": "canvas.instructure.com",
                    "placements": [
                        {
                            "placement": "course_navigation",
                            "message_type": "LtiResourceLinkRequest",
                            "target_link_uri": cfg.launch_url(),
                            "text": reg.tool_name,
                        },
                        {
                            "placement": "assignment_selection",
                            "message_type": "LtiDeepLinkingRequest",
                            "target_link_uri": cfg.deep_linking_url(),
                        }
                    ]
                }
            }
        ],
        "public_jwk_url": cfg.jwks_url(),
        "custom_fields": {
            "course_id": "$Canvas.course.id",
            "user_id": "$Canvas.user.id"
        }
    })
}

/// Key set exposed to the platform. Unconfigured tools publish an empty
/// set rather than an error.
pub fn jwks_document(reg: Option<&ToolRegistration>) -> serde_json::Value {
    match reg {
        Some(reg) => serde_json::json!({ "keys": [reg.public_jwk] }),
        None => serde_json::json!({ "keys": [] }),
    }
}

// ---------------- deep linking ----------------

pub struct ContentItem {
    pub title: String,
    pub exercise_id: String,
}

/// Signed LtiDeepLinkingResponse returned to the platform with the
/// selected content items.
pub fn build_deep_link_response(
    reg: &ToolRegistration,
    cfg: &AppConfig,
    items: &[ContentItem],
    dl_data: Option<&str>,
) -> Result<String, AppError> {
    let now = Utc::now().timestamp();
    let content_items: Vec<serde_json::Value> = items
        .iter()
        .map(|item| {
            serde_json::json!({
                "type": "ltiResourceLink",
                "title": item.title,
                "url": cfg.launch_url(),
                "custom": { "exercise_id": item.exercise_id },
            })
        })
        .collect();

    let mut claims = serde_json::json!({
        "iss": reg.client_id,
        "aud": reg.issuer,
        "iat": now,
        "exp": now + 600,
        "nonce": Uuid::new_v4().to_string(),
    });
    claims[CLAIM_MESSAGE_TYPE] = serde_json::json!("LtiDeepLinkingResponse");
    claims[CLAIM_VERSION] = serde_json::json!("1.3.0");
    claims[CLAIM_DEPLOYMENT_ID] = serde_json::json!(reg.deployment_id);
    claims[CLAIM_CONTENT_ITEMS] = serde_json::json!(content_items);
    if let Some(data) = dl_data {
        claims[CLAIM_DL_DATA] = serde_json::json!(data);
    }

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(TOOL_KID.to_string());
    let key = EncodingKey::from_rsa_pem(reg.private_key_pem.as_bytes())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("tool key unusable: {e}")))?;

    encode(&header, &claims, &key)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("deep link signing failed: {e}")))
}
