//! Input validation and output escaping for user-supplied strings.

use std::sync::OnceLock;

use regex::Regex;

fn username_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("valid username regex"))
}

/// Check that a username is non-empty and restricted to
/// alphanumerics, dot, dash and underscore.
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.is_empty() {
        return Err("username cannot be empty".to_string());
    }
    if !username_regex().is_match(username) {
        return Err(
            "username contains invalid characters (allowed: alphanumeric, dot, dash, underscore)"
                .to_string(),
        );
    }
    Ok(())
}

/// Strip control characters and trim surrounding whitespace.
/// Used on display names and other free-text inputs before they are stored;
/// rendering safety is handled by [`escape`] on the way out.
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Escape HTML-special characters so the value is safe to echo into HTML
/// or HTML-adjacent JSON consumed by the browser client.
pub fn escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_charset() {
        assert!(validate_username("alice.b-c_1").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("bad name").is_err());
        assert!(validate_username("<script>").is_err());
    }

    #[test]
    fn sanitize_strips_controls() {
        assert_eq!(sanitize("  Alice\u{0007}\n "), "Alice");
    }

    #[test]
    fn escape_html() {
        assert_eq!(escape(r#"<b a="1">"#), "&lt;b a=&quot;1&quot;&gt;");
    }
}
