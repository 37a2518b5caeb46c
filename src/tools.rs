//! Tool registry for the request server.
//!
//! Exactly three tools are exposed: `search_messages`, `list_channels`,
//! and `stats`. Each carries a JSON schema describing its input; the
//! registry validates arguments against that schema before the handler
//! runs, so handlers never see out-of-contract input.

use serde_json::{json, Value};

use crate::enhancer::{TOP_K_MAX, TOP_K_MIN};

pub const TOOL_SEARCH: &str = "search_messages";
pub const TOOL_LIST_CHANNELS: &str = "list_channels";
pub const TOOL_STATS: &str = "stats";

const QUERY_MAX_LEN: usize = 1000;
const FILTER_MAX_LEN: usize = 100;

/// A violation of a tool's input schema; maps to JSON-RPC `-32602`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidParams(pub String);

impl std::fmt::Display for InvalidParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated arguments for `search_messages`.
#[derive(Debug, Clone, Default)]
pub struct SearchArgs {
    pub query: String,
    pub top_k: Option<usize>,
    pub channel_filter: Option<String>,
    pub user_filter: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

/// The static tool descriptors returned by `tools/list`.
pub fn descriptors() -> Vec<Value> {
    vec![
        json!({
            "name": TOOL_SEARCH,
            "description": "Search workspace messages by semantic similarity, with optional channel, user, and date filters",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Natural language search query",
                        "minLength": 1,
                        "maxLength": QUERY_MAX_LEN,
                    },
                    "top_k": {
                        "type": "integer",
                        "description": "Number of results to return (1-50)",
                        "minimum": TOP_K_MIN,
                        "maximum": TOP_K_MAX,
                        "default": 10,
                    },
                    "channel_filter": {
                        "type": "string",
                        "description": "Restrict results to one channel, by name",
                    },
                    "user_filter": {
                        "type": "string",
                        "description": "Restrict results to one author, by name",
                    },
                    "date_from": {
                        "type": "string",
                        "description": "Earliest message date (YYYY-MM-DD)",
                        "pattern": "^\\d{4}-\\d{2}-\\d{2}$",
                    },
                    "date_to": {
                        "type": "string",
                        "description": "Latest message date (YYYY-MM-DD)",
                        "pattern": "^\\d{4}-\\d{2}-\\d{2}$",
                    },
                },
                "required": ["query"],
            },
        }),
        json!({
            "name": TOOL_LIST_CHANNELS,
            "description": "List the channels this workspace index covers",
            "inputSchema": { "type": "object", "properties": {} },
        }),
        json!({
            "name": TOOL_STATS,
            "description": "Statistics about the message index",
            "inputSchema": { "type": "object", "properties": {} },
        }),
    ]
}

pub fn is_known_tool(name: &str) -> bool {
    matches!(name, TOOL_SEARCH | TOOL_LIST_CHANNELS | TOOL_STATS)
}

/// Validate `search_messages` arguments against the schema.
pub fn validate_search_args(arguments: &Value) -> Result<SearchArgs, InvalidParams> {
    let query = arguments
        .get("query")
        .and_then(Value::as_str)
        .ok_or_else(|| InvalidParams("parameter 'query' is required".to_string()))?;
    if query.trim().is_empty() {
        return Err(InvalidParams("parameter 'query' must not be empty".to_string()));
    }
    if query.chars().count() > QUERY_MAX_LEN {
        return Err(InvalidParams(format!(
            "parameter 'query' exceeds {} characters",
            QUERY_MAX_LEN
        )));
    }

    // top_k outside [1,50] is accepted and clamped downstream, but it must
    // at least be an integer.
    let top_k = match arguments.get("top_k") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_u64()
                .ok_or_else(|| {
                    InvalidParams("parameter 'top_k' must be a positive integer".to_string())
                })?
                .try_into()
                .unwrap_or(usize::MAX),
        ),
    };

    let channel_filter = optional_string(arguments, "channel_filter")?;
    let user_filter = optional_string(arguments, "user_filter")?;
    let date_from = optional_date(arguments, "date_from")?;
    let date_to = optional_date(arguments, "date_to")?;

    Ok(SearchArgs {
        query: query.to_string(),
        top_k,
        channel_filter,
        user_filter,
        date_from,
        date_to,
    })
}

fn optional_string(arguments: &Value, key: &str) -> Result<Option<String>, InvalidParams> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => {
            if s.chars().count() > FILTER_MAX_LEN {
                return Err(InvalidParams(format!(
                    "parameter '{}' exceeds {} characters",
                    key, FILTER_MAX_LEN
                )));
            }
            Ok(Some(s.clone()))
        }
        Some(_) => Err(InvalidParams(format!(
            "parameter '{}' must be a string",
            key
        ))),
    }
}

fn optional_date(arguments: &Value, key: &str) -> Result<Option<String>, InvalidParams> {
    let Some(value) = optional_string(arguments, key)? else {
        return Ok(None);
    };
    if !date_pattern_valid(&value) {
        return Err(InvalidParams(format!(
            "parameter '{}' must match YYYY-MM-DD",
            key
        )));
    }
    if crate::search::day_bound(&value, false).is_none() {
        return Err(InvalidParams(format!(
            "parameter '{}' is not a valid calendar date",
            key
        )));
    }
    Ok(Some(value))
}

/// `^\d{4}-\d{2}-\d{2}$`
fn date_pattern_valid(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit())
}

/// Wrap a tool result in the MCP content envelope.
pub fn tool_content(payload: Value, is_error: bool) -> Value {
    json!({
        "content": [{
            "type": "text",
            "text": serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string()),
        }],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptors_are_exactly_three() {
        let tools = descriptors();
        assert_eq!(tools.len(), 3);
        let names: Vec<&str> = tools
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec![TOOL_SEARCH, TOOL_LIST_CHANNELS, TOOL_STATS]);
    }

    #[test]
    fn test_unknown_tool() {
        assert!(is_known_tool("search_messages"));
        assert!(!is_known_tool("delete_everything"));
    }

    #[test]
    fn test_validate_requires_query() {
        assert!(validate_search_args(&json!({})).is_err());
        assert!(validate_search_args(&json!({ "query": "  " })).is_err());
        assert!(validate_search_args(&json!({ "query": "deploy" })).is_ok());
    }

    #[test]
    fn test_validate_query_length() {
        let long = "q".repeat(QUERY_MAX_LEN + 1);
        assert!(validate_search_args(&json!({ "query": long })).is_err());
        let max = "q".repeat(QUERY_MAX_LEN);
        assert!(validate_search_args(&json!({ "query": max })).is_ok());
    }

    #[test]
    fn test_validate_top_k_type_only() {
        // Out-of-range values pass validation; the search layer clamps.
        let args = validate_search_args(&json!({ "query": "q", "top_k": 400 })).unwrap();
        assert_eq!(args.top_k, Some(400));
        assert!(validate_search_args(&json!({ "query": "q", "top_k": "ten" })).is_err());
        assert!(validate_search_args(&json!({ "query": "q", "top_k": -3 })).is_err());
    }

    #[test]
    fn test_validate_dates() {
        assert!(validate_search_args(
            &json!({ "query": "q", "date_from": "2024-03-01", "date_to": "2024-03-31" })
        )
        .is_ok());
        assert!(validate_search_args(&json!({ "query": "q", "date_from": "03/01/2024" })).is_err());
        assert!(validate_search_args(&json!({ "query": "q", "date_from": "2024-3-1" })).is_err());
        assert!(validate_search_args(&json!({ "query": "q", "date_to": "2024-02-30" })).is_err());
    }

    #[test]
    fn test_validate_filter_length() {
        let long = "c".repeat(FILTER_MAX_LEN + 1);
        assert!(validate_search_args(&json!({ "query": "q", "channel_filter": long })).is_err());
    }

    #[test]
    fn test_tool_content_envelope() {
        let wrapped = tool_content(json!({ "total": 0 }), false);
        assert_eq!(wrapped["isError"], false);
        assert_eq!(wrapped["content"][0]["type"], "text");
        assert!(wrapped["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("\"total\": 0"));
    }

    #[test]
    fn test_date_pattern() {
        assert!(date_pattern_valid("2024-03-01"));
        assert!(!date_pattern_valid("2024-03-1"));
        assert!(!date_pattern_valid("20240301"));
        assert!(!date_pattern_valid("2024-03-01T00"));
    }
}
