use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// JWT Claims structure.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Email
    pub uid: i32,    // User ID
    pub kind: TokenKind,
    pub exp: usize, // Expiration timestamp
}

/// Sign a token for a user, valid for `lifetime_hours`.
pub fn sign(
    secret: &str,
    user_id: i32,
    email: &str,
    kind: TokenKind,
    lifetime_hours: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let expiration = (Utc::now() + Duration::hours(lifetime_hours)).timestamp();

    let claims = Claims {
        sub: email.to_owned(),
        uid: user_id,
        kind,
        exp: expiration.max(0) as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Verify and decode a token of the expected kind.
pub fn verify(
    secret: &str,
    token: &str,
    kind: TokenKind,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    if token_data.claims.kind != kind {
        return Err(jsonwebtoken::errors::ErrorKind::InvalidToken.into());
    }
    Ok(token_data.claims)
}
