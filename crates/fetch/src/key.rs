use reqwest::Method;

use crate::options::RequestBody;

/// Characters of a text body that participate in the key.
pub const BODY_KEY_CHARS: usize = 50;

const MULTIPART_FRAGMENT: &str = "[multipart]";

/// Fingerprint shared by the in-flight registry and the response cache.
///
/// Only the first [`BODY_KEY_CHARS`] characters of a text body are used, so
/// bodies with a common prefix map to the same key and coalesce.
pub fn cache_key(method: &Method, url: &str, body: Option<&RequestBody>) -> String {
    let fragment: String = match body {
        None => String::new(),
        Some(RequestBody::Multipart(_)) => MULTIPART_FRAGMENT.to_string(),
        Some(RequestBody::Text(text)) => text.chars().take(BODY_KEY_CHARS).collect(),
    };
    format!("{method}:{url}:{fragment}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodyless_get() {
        assert_eq!(cache_key(&Method::GET, "/api/agents", None), "GET:/api/agents:");
    }

    #[test]
    fn method_is_part_of_key() {
        assert_ne!(
            cache_key(&Method::GET, "/api/x", None),
            cache_key(&Method::DELETE, "/api/x", None)
        );
    }

    #[test]
    fn multipart_uses_literal() {
        let body = RequestBody::Multipart(Vec::new());
        assert_eq!(
            cache_key(&Method::POST, "/upload", Some(&body)),
            "POST:/upload:[multipart]"
        );
    }

    #[test]
    fn text_body_truncated_to_prefix() {
        let prefix = "x".repeat(BODY_KEY_CHARS);
        let a = RequestBody::Text(format!("{prefix}AAAA"));
        let b = RequestBody::Text(format!("{prefix}BBBB"));
        let key_a = cache_key(&Method::POST, "/send", Some(&a));
        assert_eq!(key_a, cache_key(&Method::POST, "/send", Some(&b)));
        assert_eq!(key_a, format!("POST:/send:{prefix}"));

        let short = RequestBody::Text("{\"message\":\"hi\"}".into());
        assert_eq!(
            cache_key(&Method::POST, "/send", Some(&short)),
            "POST:/send:{\"message\":\"hi\"}"
        );
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let body = RequestBody::Text("é".repeat(60));
        let key = cache_key(&Method::PUT, "/p", Some(&body));
        assert_eq!(key.trim_start_matches("PUT:/p:").chars().count(), BODY_KEY_CHARS);
    }
}
