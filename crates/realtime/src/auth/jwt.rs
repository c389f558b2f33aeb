use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    tenant_id: Uuid,
    iat: i64,
    exp: i64,
}

/// Who is on the other end of a connection or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

/// Verifies HS256 access tokens minted by the platform's auth service.
///
/// Issuing lives here only so tests and local tooling can mint tokens
/// signed with the same secret.
#[derive(Clone)]
pub struct JwtAccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_token(&self, identity: Identity) -> anyhow::Result<String> {
        self.issue_token_at(identity, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, identity: Identity, issued_at: i64) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: identity.user_id.to_string(),
            tenant_id: identity.tenant_id,
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    pub fn validate_token(&self, token: &str) -> anyhow::Result<Identity> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .with_context(|| format!("access token subject '{}' is not a UUID", claims.sub))?;

        Ok(Identity { user_id, tenant_id: claims.tenant_id })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
