//! Query plumbing shared by cores and brokers.

use serde_json::json;

/// How a query travels: fast queries ride the priority channel, ordered
/// queries travel with normal traffic and preserve order relative to data.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    #[default]
    Fast,
    Ordered,
}

/// Error body for failed queries.
pub fn error_body(code: i32, message: &str) -> String {
    json!({ "error": { "code": code, "message": message } }).to_string()
}

pub fn not_found(target: &str) -> String {
    error_body(404, &format!("query target '{target}' was not found"))
}

pub fn unknown_query(query: &str) -> String {
    error_body(400, &format!("unrecognized query '{query}'"))
}

/// Render a list of names as a JSON array body.
pub fn name_list(names: impl IntoIterator<Item = String>) -> String {
    json!(names.into_iter().collect::<Vec<_>>()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_shape() {
        let body = error_body(404, "nope");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["error"]["code"], 404);
        assert_eq!(parsed["error"]["message"], "nope");
    }
}
