use async_trait::async_trait;

/// Maps an opaque bearer credential to a user identity.
///
/// `None` means anonymous. Resolvers never fail: a credential that cannot be
/// verified is the same as no credential.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Option<String>;
}

/// Treats every caller as anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait]
impl IdentityResolver for Anonymous {
    async fn resolve(&self, _credential: &str) -> Option<String> {
        None
    }
}

/// Token part of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_header() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("bearer   xyz "), Some("xyz"));
        assert_eq!(bearer_token("Basic dXNlcg=="), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("token"), None);
    }

    #[tokio::test]
    async fn anonymous_resolves_nobody() {
        assert_eq!(Anonymous.resolve("anything").await, None);
    }
}
