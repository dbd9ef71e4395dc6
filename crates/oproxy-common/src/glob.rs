/// `*`-wildcard match, anchored at both ends.
///
/// Patterns without `*` compare exactly. `*` matches any run of characters,
/// including the empty one.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == candidate;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = candidate;

    // First segment is anchored to the start, last to the end.
    if let Some(first) = segments.first() {
        if !rest.starts_with(first) {
            return false;
        }
        rest = &rest[first.len()..];
    }
    if let Some(last) = segments.last() {
        if segments.len() > 1 {
            if !rest.ends_with(last) {
                return false;
            }
            rest = &rest[..rest.len() - last.len()];
        }
    }

    for segment in &segments[1..segments.len().saturating_sub(1)] {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_without_wildcard() {
        assert!(glob_match("llama3", "llama3"));
        assert!(!glob_match("llama3", "llama3:8b"));
    }

    #[test]
    fn star_matches_any_run() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("llama*", "llama3:8b"));
        assert!(glob_match("*:8b", "llama3:8b"));
        assert!(glob_match("llama*8b", "llama3:8b"));
        assert!(!glob_match("qwen*", "llama3"));
    }

    #[test]
    fn star_matches_empty_run() {
        assert!(glob_match("llama*", "llama"));
        assert!(glob_match("*llama", "llama"));
    }

    #[test]
    fn multiple_stars_match_in_order() {
        assert!(glob_match("a*b*c", "aXbYc"));
        assert!(glob_match("a*b*c", "abc"));
        assert!(!glob_match("a*b*c", "acb"));
    }
}
