/// Expand `${VAR}` and `${VAR:-default}` placeholders in raw config text.
///
/// A set variable wins; an unset one falls back to its default when given.
/// Unresolvable or malformed placeholders are left as written.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: emit the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };
        let inner = &after[..end];
        let (name, default) = match inner.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (inner, None),
        };

        match (name.is_empty(), lookup(name), default) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(default)) => out.push_str(default),
            _ => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(name: &str) -> Option<String> {
        (name == "SB_PORT").then(|| "9000".to_string())
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(substitute_with("port=${SB_PORT}", fake), "port=9000");
    }

    #[test]
    fn reads_process_env() {
        let path = std::env::var("PATH").unwrap_or_default();
        assert_eq!(substitute_env("p=${PATH}"), format!("p={path}"));
    }

    #[test]
    fn default_used_when_unset() {
        assert_eq!(
            substitute_with("url=${SB_UPSTREAM:-http://localhost:3000}", fake),
            "url=http://localhost:3000"
        );
        assert_eq!(substitute_with("${SB_PORT:-1}", fake), "9000");
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            substitute_with("${SB_NONEXISTENT_XYZ}", fake),
            "${SB_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn malformed_placeholders_pass_through() {
        assert_eq!(substitute_with("a ${} b", fake), "a ${} b");
        assert_eq!(substitute_with("tail ${SB_PORT", fake), "tail ${SB_PORT");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_with("plain $text", fake), "plain $text");
    }
}
