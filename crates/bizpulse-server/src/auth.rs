//! Bearer-token resolution to a [`BusinessId`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use bizpulse_core::BusinessId;
use bizpulse_settings::{AuthMode, AuthSettings, SettingsError};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Why a connection could not be bound to a business. Every variant closes
/// the socket with [`AuthError::CLOSE_CODE`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no token supplied")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
    #[error("token is not bound to a business")]
    UnknownBusiness,
}

impl AuthError {
    /// `WebSocket` policy-violation close code.
    pub const CLOSE_CODE: u16 = 1008;
    pub const CLOSE_REASON: &'static str = "Authentication failed";
}

#[async_trait]
pub trait TokenAuthenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<BusinessId, AuthError>;
}

/// Token from `Authorization: Bearer <token>`, falling back to the `token`
/// query parameter. The header wins when both are present.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty());

    from_header
        .or_else(|| query_token.map(str::trim).filter(|t| !t.is_empty()))
        .map(str::to_owned)
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
    iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
}

/// HS256 JWTs whose `sub` claim is the business id.
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: Option<String>,
}

impl JwtAuthenticator {
    pub fn new(secret: &str, issuer: Option<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        if let Some(iss) = &issuer {
            validation.set_issuer(&[iss]);
        }
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer,
        }
    }

    /// Fails when no secret is configured.
    pub fn from_settings(settings: &AuthSettings) -> Result<Self, SettingsError> {
        let secret = settings.require_jwt_secret()?;
        Ok(Self::new(secret, settings.jwt_issuer.clone()))
    }

    /// Sign a token for `business_id` valid for `ttl`.
    pub fn mint_token(&self, business_id: &BusinessId, ttl: Duration) -> Result<String, AuthError> {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
        self.encode(&Claims {
            sub: business_id.to_string(),
            exp: now.saturating_add(ttl.as_secs()),
            iat: now,
            iss: self.issuer.clone(),
        })
    }

    fn encode(&self, claims: &Claims) -> Result<String, AuthError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

#[async_trait]
impl TokenAuthenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<BusinessId, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;
        let sub = data.claims.sub.trim();
        if sub.is_empty() {
            return Err(AuthError::UnknownBusiness);
        }
        Ok(BusinessId::from(sub))
    }
}

/// Fixed `token → business` table, for local development.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, BusinessId>,
}

impl StaticTokenAuthenticator {
    pub fn new<I, T, B>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (T, B)>,
        T: Into<String>,
        B: Into<BusinessId>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(t, b)| (t.into(), b.into()))
                .collect(),
        }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(settings.static_tokens.clone())
    }
}

#[async_trait]
impl TokenAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<BusinessId, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown token".into()))
    }
}

/// Authenticator selected by `settings.mode`.
pub fn build_authenticator(
    settings: &AuthSettings,
) -> Result<Arc<dyn TokenAuthenticator>, SettingsError> {
    Ok(match settings.mode {
        AuthMode::Jwt => Arc::new(JwtAuthenticator::from_settings(settings)?),
        AuthMode::Static => Arc::new(StaticTokenAuthenticator::from_settings(settings)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        let _ = h.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        h
    }

    #[test]
    fn bearer_header_is_extracted() {
        assert_eq!(
            extract_token(&headers("Bearer abc123"), None).as_deref(),
            Some("abc123")
        );
        assert_eq!(
            extract_token(&headers("bearer  abc123 "), None).as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn header_wins_over_query() {
        assert_eq!(
            extract_token(&headers("Bearer from-header"), Some("from-query")).as_deref(),
            Some("from-header")
        );
    }

    #[test]
    fn query_used_when_header_absent_or_unusable() {
        assert_eq!(
            extract_token(&HeaderMap::new(), Some("q")).as_deref(),
            Some("q")
        );
        assert_eq!(
            extract_token(&headers("Basic dXNlcjpwYXNz"), Some("q")).as_deref(),
            Some("q")
        );
    }

    #[test]
    fn missing_everywhere_is_none() {
        assert!(extract_token(&HeaderMap::new(), None).is_none());
        assert!(extract_token(&headers("Bearer "), Some("")).is_none());
    }

    #[tokio::test]
    async fn jwt_round_trip_resolves_business() {
        let auth = JwtAuthenticator::new("secret", None);
        let token = auth
            .mint_token(&"biz1".into(), Duration::from_secs(60))
            .unwrap();
        assert_eq!(auth.authenticate(&token).await.unwrap().as_str(), "biz1");
    }

    #[tokio::test]
    async fn jwt_wrong_secret_is_invalid() {
        let minted = JwtAuthenticator::new("one", None)
            .mint_token(&"biz1".into(), Duration::from_secs(60))
            .unwrap();
        let err = JwtAuthenticator::new("two", None)
            .authenticate(&minted)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn jwt_expired_token() {
        let auth = JwtAuthenticator::new("secret", None);
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap();
        let token = auth
            .encode(&Claims {
                sub: "biz1".into(),
                exp: now - 3600,
                iat: now - 7200,
                iss: None,
            })
            .unwrap();
        assert_eq!(auth.authenticate(&token).await.unwrap_err(), AuthError::Expired);
    }

    #[tokio::test]
    async fn jwt_empty_subject_is_unknown_business() {
        let auth = JwtAuthenticator::new("secret", None);
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap();
        let token = auth
            .encode(&Claims {
                sub: String::new(),
                exp: now + 60,
                iat: now,
                iss: None,
            })
            .unwrap();
        assert_eq!(
            auth.authenticate(&token).await.unwrap_err(),
            AuthError::UnknownBusiness
        );
    }

    #[tokio::test]
    async fn jwt_issuer_is_enforced() {
        let strict = JwtAuthenticator::new("secret", Some("bizpulse".into()));
        let other = JwtAuthenticator::new("secret", Some("elsewhere".into()));
        let token = other
            .mint_token(&"biz1".into(), Duration::from_secs(60))
            .unwrap();
        assert!(strict.authenticate(&token).await.is_err());

        let good = strict
            .mint_token(&"biz1".into(), Duration::from_secs(60))
            .unwrap();
        assert!(strict.authenticate(&good).await.is_ok());
    }

    #[tokio::test]
    async fn garbage_token_is_invalid() {
        let auth = JwtAuthenticator::new("secret", None);
        assert!(matches!(
            auth.authenticate("not-a-jwt").await,
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn static_table_lookup() {
        let auth = StaticTokenAuthenticator::new([("t1", "biz1"), ("t2", "biz2")]);
        assert_eq!(auth.authenticate("t2").await.unwrap().as_str(), "biz2");
        assert!(matches!(
            auth.authenticate("t3").await,
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn build_from_settings_follows_mode() {
        let mut settings = AuthSettings::default();
        settings.mode = AuthMode::Static;
        let _ = settings
            .static_tokens
            .insert("dev".into(), "biz-dev".into());
        let auth = build_authenticator(&settings).unwrap();
        assert_eq!(auth.authenticate("dev").await.unwrap().as_str(), "biz-dev");

        settings.mode = AuthMode::Jwt;
        settings.jwt_secret = "s3cret".into();
        let auth = build_authenticator(&settings).unwrap();
        assert!(auth.authenticate("dev").await.is_err());
    }

    #[test]
    fn jwt_mode_requires_a_configured_secret() {
        let settings = AuthSettings::default();
        assert!(matches!(
            build_authenticator(&settings),
            Err(SettingsError::InvalidValue(_))
        ));
        assert!(JwtAuthenticator::from_settings(&settings).is_err());
    }

    #[test]
    fn close_code_is_policy_violation() {
        assert_eq!(AuthError::CLOSE_CODE, 1008);
        assert_eq!(AuthError::CLOSE_REASON, "Authentication failed");
    }
}
