use crate::headers::HeaderSnapshot;

const AUTHORIZATION: &str = "authorization";
const X_API_KEY: &str = "x-api-key";
const X_GOOG_API_KEY: &str = "x-goog-api-key";

/// Extract the caller's API credential for the `auth_token` dynamic metadata.
///
/// Checked in order:
/// - `Authorization: Bearer <key>`
/// - `x-api-key: <key>` (Anthropic)
/// - `x-goog-api-key: <key>` (Gemini)
#[must_use]
pub fn extract_auth_token(headers: &HeaderSnapshot) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get(X_API_KEY))
        .or_else(|| headers.get(X_GOOG_API_KEY))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token() {
        let headers = HeaderSnapshot::from_pairs([("Authorization", "Bearer sk-abc")]);
        assert_eq!(extract_auth_token(&headers), Some("sk-abc"));
    }

    #[test]
    fn test_anthropic_key() {
        let headers = HeaderSnapshot::from_pairs([("x-api-key", "sk-ant-123")]);
        assert_eq!(extract_auth_token(&headers), Some("sk-ant-123"));
    }

    #[test]
    fn test_gemini_key() {
        let headers = HeaderSnapshot::from_pairs([("x-goog-api-key", "AIza-xyz")]);
        assert_eq!(extract_auth_token(&headers), Some("AIza-xyz"));
    }

    #[test]
    fn test_non_bearer_authorization_falls_through() {
        let headers = HeaderSnapshot::from_pairs([
            ("authorization", "Basic dXNlcjpwYXNz"),
            ("x-goog-api-key", "AIza-xyz"),
        ]);
        assert_eq!(extract_auth_token(&headers), Some("AIza-xyz"));
    }

    #[test]
    fn test_missing() {
        assert_eq!(extract_auth_token(&HeaderSnapshot::new()), None);
    }
}
