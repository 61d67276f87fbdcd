//! Parameter scanning and sanitization
//!
//! Every string inside the parameter tree is scanned for path traversal,
//! shell metacharacters, and SQL injection shapes. Sanitization then
//! produces the copy actually handed to the tool.

use super::registry::ToolKind;
use crate::types::Severity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Parameter names treated as filesystem paths
const PATH_KEYS: &[&str] = &[
    "path",
    "file",
    "filename",
    "file_path",
    "dir",
    "directory",
    "source",
    "destination",
    "target",
    "src",
    "dst",
];

/// Parameter names treated as URLs
const URL_KEYS: &[&str] = &["url", "uri", "endpoint", "href", "link"];

/// Schemes a network tool may be pointed at
const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Kind of problem found in a parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamThreat {
    PathTraversal,
    CommandInjection,
    SqlInjection,
    DisallowedProtocol,
}

impl ParamThreat {
    pub fn severity(&self) -> Severity {
        match self {
            ParamThreat::PathTraversal | ParamThreat::CommandInjection => Severity::Critical,
            ParamThreat::SqlInjection | ParamThreat::DisallowedProtocol => Severity::High,
        }
    }
}

/// A threat found at a JSON path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamFinding {
    pub threat: ParamThreat,
    pub path: String,
    pub detail: String,
}

fn traversal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:\.\.|%2e%2e|%252e%252e|\.%2e|%2e\.)(?:/|\\|%2f|%5c|%252f|%255c|$)").unwrap()
    })
}

fn shell_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[;&|`<>]|\$\(|\$\{").unwrap())
}

/// Query strings legitimately carry `&`, `|`, `<` and `>`
fn url_shell_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[;`]|\$\(|\$\{").unwrap())
}

fn sql_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bunion\s+(?:all\s+)?select\b",
            r"(?i);\s*(?:drop|delete|truncate|alter|insert|update|create)\s",
            r"(?i)'\s*or\s+'?\w+'?\s*=\s*'?\w+",
            r"(?i)\bor\s+1\s*=\s*1\b",
            r"(?i)'\s*;?\s*--",
            r"/\*.*?\*/",
            r"(?i)\b(?:sleep|benchmark|pg_sleep)\s*\(\s*\d+",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Scan every string in `params` for injection shapes
pub fn scan(params: &Value, kind: ToolKind) -> Vec<ParamFinding> {
    let mut findings = Vec::new();
    walk_strings(params, "$", &mut |path, s| {
        if traversal_regex().is_match(s) {
            findings.push(ParamFinding {
                threat: ParamThreat::PathTraversal,
                path: path.to_string(),
                detail: "parent directory reference".to_string(),
            });
        }
        if kind != ToolKind::Shell {
            let key = path.rsplit('.').next().unwrap_or_default();
            let url_key = URL_KEYS.contains(&key.to_ascii_lowercase().as_str());
            let metachars = if kind == ToolKind::Network && url_key {
                url_shell_regex()
            } else {
                shell_regex()
            };
            if let Some(m) = metachars.find(s) {
                findings.push(ParamFinding {
                    threat: ParamThreat::CommandInjection,
                    path: path.to_string(),
                    detail: format!("shell metacharacter {:?}", m.as_str()),
                });
            }
        }
        if sql_patterns().iter().any(|re| re.is_match(s)) {
            findings.push(ParamFinding {
                threat: ParamThreat::SqlInjection,
                path: path.to_string(),
                detail: "SQL injection pattern".to_string(),
            });
        }
    });
    findings
}

fn walk_strings(value: &Value, path: &str, visit: &mut dyn FnMut(&str, &str)) {
    match value {
        Value::String(s) => visit(path, s),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk_strings(item, &format!("{}[{}]", path, i), visit);
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                walk_strings(child, &format!("{}.{}", path, key), visit);
            }
        }
        _ => {}
    }
}

/// Result of [`sanitize`]
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedParams {
    pub value: Value,
    pub findings: Vec<ParamFinding>,
}

/// Produce the parameter copy handed to the tool
///
/// Strings lose control characters and surrounding whitespace. For
/// filesystem tools, path-like values are canonicalized. For network tools,
/// URL-like values with a scheme other than http/https are removed.
pub fn sanitize(params: &Value, kind: ToolKind, schema: &Value) -> SanitizedParams {
    let mut findings = Vec::new();
    let value = sanitize_value(params, kind, schema, "$", None, &mut findings);
    SanitizedParams { value, findings }
}

fn sanitize_value(
    value: &Value,
    kind: ToolKind,
    schema: &Value,
    path: &str,
    key: Option<&str>,
    findings: &mut Vec<ParamFinding>,
) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_string(s, kind, schema, key)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let item_schema = schema.get("items").unwrap_or(&Value::Null);
                    sanitize_value(item, kind, item_schema, &format!("{}[{}]", path, i), key, findings)
                })
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for (child_key, child) in map {
                let child_path = format!("{}.{}", path, child_key);
                let child_schema = schema
                    .get("properties")
                    .and_then(|p| p.get(child_key))
                    .unwrap_or(&Value::Null);

                if kind == ToolKind::Network {
                    if let Value::String(s) = child {
                        if is_url_param(child_key, child_schema) && !scheme_allowed(s) {
                            findings.push(ParamFinding {
                                threat: ParamThreat::DisallowedProtocol,
                                path: child_path,
                                detail: format!("scheme '{}' not allowed", scheme_of(s).unwrap_or("")),
                            });
                            continue;
                        }
                    }
                }

                out.insert(
                    child_key.clone(),
                    sanitize_value(child, kind, child_schema, &child_path, Some(child_key), findings),
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn sanitize_string(s: &str, kind: ToolKind, schema: &Value, key: Option<&str>) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect();
    let cleaned = cleaned.trim().to_string();

    if kind == ToolKind::Filesystem && is_path_param(key, schema) {
        return canonicalize_path(&cleaned);
    }
    cleaned
}

fn schema_format(schema: &Value) -> Option<&str> {
    schema.get("format").and_then(Value::as_str)
}

fn is_path_param(key: Option<&str>, schema: &Value) -> bool {
    matches!(schema_format(schema), Some("path"))
        || key.is_some_and(|k| PATH_KEYS.contains(&k.to_ascii_lowercase().as_str()))
}

fn is_url_param(key: &str, schema: &Value) -> bool {
    matches!(schema_format(schema), Some("uri") | Some("url"))
        || URL_KEYS.contains(&key.to_ascii_lowercase().as_str())
}

fn scheme_of(url: &str) -> Option<&str> {
    let idx = url.find(':')?;
    let scheme = &url[..idx];
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// URLs without a scheme are treated as https
fn scheme_allowed(url: &str) -> bool {
    let url = url.trim();
    let Some(scheme) = scheme_of(url) else {
        return true;
    };
    let rest = &url[scheme.len() + 1..];
    if rest.starts_with("//") {
        return ALLOWED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str());
    }
    // `host:port/path` carries no scheme
    rest.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Lexically normalize a path: collapse separators, drop `.` segments
pub fn canonicalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let segments: Vec<&str> = unified
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn threats(findings: &[ParamFinding]) -> Vec<ParamThreat> {
        findings.iter().map(|f| f.threat).collect()
    }

    #[test]
    fn test_path_traversal_detected() {
        let findings = scan(&json!({"path": "../../etc/passwd"}), ToolKind::Filesystem);
        assert_eq!(threats(&findings), vec![ParamThreat::PathTraversal]);
        assert_eq!(findings[0].path, "$.path");
        assert_eq!(ParamThreat::PathTraversal.severity(), Severity::Critical);
    }

    #[test]
    fn test_encoded_traversal_detected() {
        for p in ["%2e%2e%2fetc", "..%2Fsecret", "a\\..\\b", "logs/.."] {
            let findings = scan(&json!({ "path": p }), ToolKind::Filesystem);
            assert!(
                threats(&findings).contains(&ParamThreat::PathTraversal),
                "missed {}",
                p
            );
        }
    }

    #[test]
    fn test_dots_in_names_allowed() {
        let findings = scan(&json!({"path": "report..final.txt"}), ToolKind::Filesystem);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_shell_metacharacters_only_for_non_shell_tools() {
        let params = json!({"query": "weather; rm -rf /"});
        assert!(threats(&scan(&params, ToolKind::Network)).contains(&ParamThreat::CommandInjection));
        assert!(!threats(&scan(&params, ToolKind::Shell)).contains(&ParamThreat::CommandInjection));
    }

    #[test]
    fn test_query_string_url_allowed_for_network_tools() {
        let params = json!({"url": "https://api.github.com/search/code?q=foo&page=2"});
        assert!(scan(&params, ToolKind::Network).is_empty());

        // Still substitution-checked, and other keys keep the full set
        let params = json!({"url": "https://x.example/?q=$(id)", "note": "a&b"});
        let findings = scan(&params, ToolKind::Network);
        let paths: Vec<&str> = findings.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["$.note", "$.url"]);
    }

    #[test]
    fn test_sql_injection() {
        let findings = scan(&json!({"name": "x' OR '1'='1"}), ToolKind::Database);
        assert!(threats(&findings).contains(&ParamThreat::SqlInjection));
        assert_eq!(ParamThreat::SqlInjection.severity(), Severity::High);

        let union = scan(&json!({"q": "1 UNION SELECT password FROM users"}), ToolKind::Database);
        assert!(threats(&union).contains(&ParamThreat::SqlInjection));
    }

    #[test]
    fn test_nested_values_scanned() {
        let findings = scan(
            &json!({"files": [{"path": "ok.txt"}, {"path": "../secret"}]}),
            ToolKind::Filesystem,
        );
        assert_eq!(findings[0].path, "$.files[1].path");
    }

    #[test]
    fn test_canonicalize_path() {
        assert_eq!(canonicalize_path("./docs//notes/./a.txt"), "docs/notes/a.txt");
        assert_eq!(canonicalize_path("/var//log/"), "/var/log");
        assert_eq!(canonicalize_path("."), ".");
        assert_eq!(canonicalize_path("dir\\sub\\f.txt"), "dir/sub/f.txt");
    }

    #[test]
    fn test_sanitize_filesystem_paths_and_controls() {
        let schema = json!({"type": "object"});
        let result = sanitize(
            &json!({"path": "  ./docs//a.txt\u{0007} ", "note": "hi\u{0000}"}),
            ToolKind::Filesystem,
            &schema,
        );
        assert_eq!(result.value, json!({"path": "docs/a.txt", "note": "hi"}));
        assert!(result.findings.is_empty());
    }

    #[test]
    fn test_sanitize_drops_disallowed_scheme() {
        let schema = json!({"type": "object", "properties": {"target": {"type": "string", "format": "uri"}}});
        let result = sanitize(
            &json!({"url": "file:///etc/passwd", "target": "gopher://x", "ok": "https://example.com"}),
            ToolKind::Network,
            &schema,
        );
        assert_eq!(result.value, json!({"ok": "https://example.com"}));
        assert_eq!(result.findings.len(), 2);
        assert!(result
            .findings
            .iter()
            .all(|f| f.threat == ParamThreat::DisallowedProtocol));
    }

    #[test]
    fn test_scheme_allowed() {
        assert!(scheme_allowed("https://example.com"));
        assert!(scheme_allowed("HTTP://example.com"));
        assert!(scheme_allowed("example.com/path"));
        assert!(scheme_allowed("localhost:8080/x"));
        assert!(!scheme_allowed("ftp://example.com"));
        assert!(!scheme_allowed("javascript:alert(1)"));
    }
}
