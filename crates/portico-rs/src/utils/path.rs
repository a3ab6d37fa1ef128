//! URL and path helpers for request forwarding.

use std::collections::HashMap;

/// Joins a backend base URL with a request path and query.
///
/// The base may or may not carry a trailing slash; the result always has
/// exactly one slash at the join point and appends the query when present.
pub fn join_target_url(base: &str, path: &str, raw_query: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut url = format!("{}{}", base, path);
    if !raw_query.is_empty() {
        url.push('?');
        url.push_str(raw_query);
    }
    url
}

/// Substitutes `{name}` placeholders in a rewrite template with extracted
/// path parameters. Unknown placeholders are left untouched.
pub fn apply_rewrite(template: &str, params: &HashMap<String, String>) -> String {
    let mut result = template.to_string();
    for (name, value) in params {
        let placeholder = format!("{{{}}}", name);
        result = result.replace(&placeholder, value);
    }
    result
}

/// Splits a path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_base_and_path() {
        assert_eq!(
            join_target_url("http://backend:8080", "/v1/users", ""),
            "http://backend:8080/v1/users"
        );
        assert_eq!(
            join_target_url("http://backend:8080/", "/v1/users", "page=2"),
            "http://backend:8080/v1/users?page=2"
        );
    }

    #[test]
    fn rewrite_substitutes_params() {
        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        assert_eq!(apply_rewrite("/v1/user/{id}", &params), "/v1/user/42");
        assert_eq!(apply_rewrite("/v1/{other}", &params), "/v1/{other}");
    }

    #[test]
    fn path_segments() {
        assert_eq!(segments("/api/users/42"), vec!["api", "users", "42"]);
        assert_eq!(segments("/"), Vec::<&str>::new());
    }
}
