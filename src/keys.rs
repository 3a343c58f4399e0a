// RSA key material for the tool: generation plus the JWK form the
// platform consumes at our JWKS endpoint.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

pub const TOOL_KID: &str = "lti-gateway-tool-key";
const KEY_BITS: usize = 2048;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("malformed key: {0}")]
    Format(String),
    #[error("key generation failed: {0}")]
    Generate(String),
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    /// PKCS#8 PEM
    pub private_pem: String,
    /// SPKI PEM
    pub public_pem: String,
}

pub fn generate_key_pair() -> Result<KeyPair, KeyError> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| KeyError::Generate(e.to_string()))?;
    let public = RsaPublicKey::from(&private);

    let private_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KeyError::Format(e.to_string()))?
        .to_string();
    let public_pem = public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeyError::Format(e.to_string()))?;

    Ok(KeyPair { private_pem, public_pem })
}

/// Pure transform: SPKI PEM -> RS256 signing JWK. Callers persist the result.
pub fn public_key_to_jwk(public_pem: &str) -> Result<serde_json::Value, KeyError> {
    let public = RsaPublicKey::from_public_key_pem(public_pem)
        .map_err(|e| KeyError::Format(e.to_string()))?;

    let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());

    Ok(serde_json::json!({
        "kty": "RSA",
        "n": n,
        "e": e,
        "alg": "RS256",
        "use": "sig",
        "kid": TOOL_KID,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pair_round_trips_into_a_jwk() {
        let pair = generate_key_pair().unwrap();
        assert!(pair.private_pem.contains("BEGIN PRIVATE KEY"));
        assert!(pair.public_pem.contains("BEGIN PUBLIC KEY"));

        let jwk = public_key_to_jwk(&pair.public_pem).unwrap();
        assert_eq!(jwk["kty"], "RSA");
        assert_eq!(jwk["alg"], "RS256");
        assert_eq!(jwk["use"], "sig");
        assert_eq!(jwk["kid"], TOOL_KID);

        // modulus of a 2048-bit key is 256 bytes; b64url w/o padding
        let n = jwk["n"].as_str().unwrap();
        assert!(!n.ends_with('='));
        assert!(n.len() >= 340);
        // standard exponent 65537 -> "AQAB"
        assert_eq!(jwk["e"], "AQAB");
    }

    #[test]
    fn jwk_derivation_is_deterministic() {
        let pair = generate_key_pair().unwrap();
        let a = public_key_to_jwk(&pair.public_pem).unwrap();
        let b = public_key_to_jwk(&pair.public_pem).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_pem_is_a_format_error() {
        let err = public_key_to_jwk("not a pem").unwrap_err();
        assert!(matches!(err, KeyError::Format(_)));
    }
}
