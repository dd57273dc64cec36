//! Token verification.
//!
//! Clients present a JWT issued by the metadata service. A token is accepted
//! when it has the three-part compact form, its signature verifies against
//! the configured key, its `iss` matches and it carries the principal claim.
//! The handlers only ever see the principal ID, never the raw token.

use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::config::AuthConfig;

/// Verifies a bearer token and returns the principal it names.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> anyhow::Result<String>;
}

/// JWT verifier on `jsonwebtoken`.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    claim: String,
}

impl JwtVerifier {
    /// Build a verifier from the `auth` config section, reading the public
    /// key file for asymmetric algorithms.
    pub fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        let algorithm = Algorithm::from_str(&config.algorithm)
            .map_err(|_| anyhow!("unsupported JWT algorithm {:?}", config.algorithm))?;
        let key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = config
                    .secret
                    .as_deref()
                    .context("auth.secret is required for HMAC algorithms")?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            _ => {
                let pem = std::fs::read(&config.public_key_path).with_context(|| {
                    format!("reading public key {}", config.public_key_path)
                })?;
                decoding_key_from_pem(algorithm, &pem)?
            }
        };
        Ok(Self::new(key, algorithm, &config.issuer, &config.claim))
    }

    /// HMAC verifier with the default principal claim.
    pub fn hmac(secret: &[u8], issuer: &str) -> Self {
        Self::new(
            DecodingKey::from_secret(secret),
            Algorithm::HS256,
            issuer,
            "userID",
        )
    }

    fn new(key: DecodingKey, algorithm: Algorithm, issuer: &str, claim: &str) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[issuer]);
        validation.required_spec_claims = HashSet::from(["iss".to_string()]);
        Self {
            key,
            validation,
            claim: claim.to_string(),
        }
    }
}

fn decoding_key_from_pem(algorithm: Algorithm, pem: &[u8]) -> anyhow::Result<DecodingKey> {
    let key = match algorithm {
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem)?,
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem)?,
        _ => DecodingKey::from_rsa_pem(pem)?,
    };
    Ok(key)
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> anyhow::Result<String> {
        if token.matches('.').count() != 2 {
            bail!("token is not a compact JWT");
        }
        let data = decode::<serde_json::Map<String, serde_json::Value>>(
            token,
            &self.key,
            &self.validation,
        )?;
        match data.claims.get(&self.claim) {
            Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(serde_json::Value::Number(id)) => Ok(id.to_string()),
            _ => bail!("token has no {} claim", self.claim),
        }
    }
}
