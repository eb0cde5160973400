use agent::IdentityResolver;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

/// HS256 bearer tokens; the `sub` claim is the user identity.
#[derive(Clone)]
pub struct JwtIdentity {
    decoding: DecodingKey,
    validation: Validation,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

impl JwtIdentity {
    pub fn new(secret: &[u8], issuer: Option<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentity {
    async fn resolve(&self, credential: &str) -> Option<String> {
        match decode::<Claims>(credential, &self.decoding, &self.validation) {
            Ok(data) => Some(data.claims.sub).filter(|sub| !sub.is_empty()),
            Err(err) => {
                debug!(%err, "rejected bearer token; treating caller as anonymous");
                None
            }
        }
    }
}
