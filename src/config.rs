use std::env;

/// Runtime configuration, read once at startup and carried in axum state.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Externally reachable base URL of this tool, e.g. "https://tool.example.com".
    pub public_base_url: String,
    /// Where gated student traffic is sent after the access checks pass.
    pub target_app_url: String,
    /// Keyed-derivation secret for the flag codec.
    pub flag_key: String,
    /// LMS directory REST base, e.g. "https://lms.example.com/api/v1".
    pub lms_api_url: String,
    pub lms_api_token: String,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8081".into())
            .trim_end_matches('/')
            .to_string();
        let target_app_url =
            env::var("TARGET_APP_URL").unwrap_or_else(|_| "http://localhost:3000".into());
        let flag_key = env::var("FLAG_KEY")
            .map_err(|_| anyhow::anyhow!("FLAG_KEY not set"))?;
        let lms_api_url = env::var("LMS_API_URL")
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();
        let lms_api_token = env::var("LMS_API_TOKEN").unwrap_or_default();
        let port = env::var("PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(8081);

        Ok(Self {
            public_base_url,
            target_app_url,
            flag_key,
            lms_api_url,
            lms_api_token,
            port,
        })
    }

    pub fn launch_url(&self) -> String {
        format!("{}/lti/launch", self.public_base_url)
    }

    pub fn jwks_url(&self) -> String {
        format!("{}/lti/jwks", self.public_base_url)
    }

    pub fn oidc_initiation_url(&self) -> String {
        format!("{}/lti/login", self.public_base_url)
    }

    pub fn deep_linking_url(&self) -> String {
        format!("{}/lti/deep_linking", self.public_base_url)
    }
}
