//! Rendering of Moodle payloads into tool output.
//!
//! Markdown is the default because it is markedly more token-efficient than
//! pretty JSON for the list-heavy payloads Moodle returns; `format="json"`
//! gives the raw payload for callers that want to post-process.

use serde_json::{Map, Value};

/// Unix-seconds fields rendered as human-readable datetimes in Markdown.
const TIMESTAMP_FIELDS: [&str; 7] = [
    "startdate",
    "enddate",
    "timestart",
    "timemodified",
    "timecreated",
    "lastaccess",
    "firstaccess",
];

/// How many list elements are inlined before collapsing to a count.
const INLINE_LIST_MAX: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Markdown,
    Json,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Some(OutputFormat::Markdown),
            "json" => Some(OutputFormat::Json),
            _ => None,
        }
    }
}

pub fn format_response(data: &Value, title: Option<&str>, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => format_as_json(data),
        OutputFormat::Markdown => format_as_markdown(data, title),
    }
}

pub fn format_as_json(data: &Value) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| "null".to_string())
}

pub fn format_as_markdown(data: &Value, title: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();

    if let Some(title) = title {
        lines.push(format!("# {title}\n"));
    }

    match data {
        Value::Array(items) => {
            lines.push(format!("**Total items:** {}\n", items.len()));
            if items.is_empty() {
                lines.push("*No items found*\n".to_string());
            } else {
                for (i, item) in items.iter().enumerate() {
                    if let Some(obj) = item.as_object() {
                        lines.push(format!("## {}. {}", i + 1, display_name(obj)));
                        push_fields(&mut lines, obj);
                        lines.push(String::new());
                    } else {
                        lines.push(format!("{}. {}", i + 1, scalar_text(item)));
                    }
                }
            }
        }
        Value::Object(obj) => push_fields(&mut lines, obj),
        other => lines.push(scalar_text(other)),
    }

    lines.join("\n")
}

/// Heading for a list item: fullname > name > title > id.
fn display_name(obj: &Map<String, Value>) -> String {
    for key in ["fullname", "name", "title"] {
        if let Some(text) = obj.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    match obj.get("id") {
        Some(id) => format!("Item {id}"),
        None => "Item".to_string(),
    }
}

fn push_fields(lines: &mut Vec<String>, obj: &Map<String, Value>) {
    for (field, value) in obj {
        let rendered = match value {
            Value::Null => continue,
            Value::String(s) if s.is_empty() => continue,
            Value::Array(items) if items.is_empty() => continue,
            Value::Bool(b) => if *b { "\u{2713}" } else { "\u{2717}" }.to_string(),
            Value::Array(items) if items.len() <= INLINE_LIST_MAX => items
                .iter()
                .map(scalar_text)
                .collect::<Vec<_>>()
                .join(", "),
            Value::Array(items) => format!("{} items", items.len()),
            Value::Object(nested) => inline_object(nested),
            Value::Number(n) if TIMESTAMP_FIELDS.contains(&field.as_str()) => {
                match n.as_i64().filter(|ts| *ts > 0) {
                    Some(ts) => render_timestamp(ts),
                    None => continue,
                }
            }
            other => scalar_text(other),
        };
        lines.push(format!("- **{}:** {rendered}", field_label(field)));
    }
}

fn inline_object(obj: &Map<String, Value>) -> String {
    let parts: Vec<String> = obj
        .iter()
        .filter(|(_, v)| !matches!(v, Value::Null) && v.as_str() != Some(""))
        .map(|(k, v)| format!("{k}: {}", scalar_text(v)))
        .collect();
    if parts.is_empty() {
        "N/A".to_string()
    } else {
        parts.join("; ")
    }
}

fn render_timestamp(ts: i64) -> String {
    match chrono::DateTime::from_timestamp(ts, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => ts.to_string(),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `course_id` → `Course Id`.
fn field_label(field: &str) -> String {
    field
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cap tool output at `max_chars` characters, preferring a newline break and
/// appending a notice so the caller knows data was cut off.
pub fn truncate_response(content: String, max_chars: usize) -> String {
    let total_chars = content.chars().count();
    if total_chars <= max_chars {
        return content;
    }

    let cut = content
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(content.len());
    let mut truncated = &content[..cut];

    // Break at a newline within the last 500 characters when one exists.
    let window_start = truncated
        .char_indices()
        .rev()
        .nth(499)
        .map(|(i, _)| i)
        .unwrap_or(0);
    if let Some(pos) = truncated[window_start..].rfind('\n') {
        if window_start + pos > 0 {
            truncated = &truncated[..window_start + pos];
        }
    }

    format!(
        "{truncated}\n\n---\n\n\u{26a0} **Response truncated at {} characters** \
         (original: {total_chars} characters)\n\n\
         To see more results:\n\
         - Use pagination parameters (limit, offset)\n\
         - Add filters to narrow down results\n\
         - Request specific items by ID",
        truncated.chars().count()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_parse_accepts_known_names_only() {
        assert_eq!(OutputFormat::parse("markdown"), Some(OutputFormat::Markdown));
        assert_eq!(OutputFormat::parse(" JSON "), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::parse("yaml"), None);
    }

    #[test]
    fn markdown_lists_carry_count_and_display_names() {
        let data = json!([
            {"id": 2292, "fullname": "Intro to Rust", "visible": true},
            {"id": 7299, "shortname": "sandbox"}
        ]);
        let out = format_as_markdown(&data, Some("Courses"));
        assert!(out.starts_with("# Courses\n"));
        assert!(out.contains("**Total items:** 2"));
        assert!(out.contains("## 1. Intro to Rust"));
        // No fullname/name/title falls back to the id.
        assert!(out.contains("## 2. Item 7299"));
        assert!(out.contains("- **Visible:** \u{2713}"));
    }

    #[test]
    fn markdown_skips_empty_fields_and_renders_timestamps() {
        let data = json!({
            "fullname": "Sandbox",
            "summary": "",
            "categories": [],
            "startdate": 1700000000,
            "enddate": 0
        });
        let out = format_as_markdown(&data, None);
        assert!(!out.contains("Summary"));
        assert!(!out.contains("Categories"));
        assert!(!out.contains("Enddate"));
        assert!(out.contains("- **Startdate:** 2023-11-14 22:13:20 UTC"));
    }

    #[test]
    fn markdown_collapses_large_lists_to_counts() {
        let data = json!({"small": [1, 2, 3], "large": [1, 2, 3, 4, 5, 6, 7]});
        let out = format_as_markdown(&data, None);
        assert!(out.contains("- **Small:** 1, 2, 3"));
        assert!(out.contains("- **Large:** 7 items"));
    }

    #[test]
    fn empty_list_says_so() {
        let out = format_as_markdown(&json!([]), None);
        assert!(out.contains("*No items found*"));
    }

    #[test]
    fn json_format_is_pretty_printed_verbatim() {
        let data = json!({"id": 1, "empty": ""});
        let out = format_response(&data, Some("ignored"), OutputFormat::Json);
        assert!(out.contains("\"empty\": \"\""));
        assert!(!out.contains("ignored"));
    }

    #[test]
    fn truncation_is_a_noop_below_the_limit() {
        let content = "short".to_string();
        assert_eq!(truncate_response(content.clone(), 50), content);
    }

    #[test]
    fn truncation_appends_notice_and_respects_limit() {
        let content = "line\n".repeat(20_000);
        let out = truncate_response(content, 1_000);
        assert!(out.contains("**Response truncated at"));
        let body = out.split("\n\n---\n\n").next().unwrap();
        assert!(body.chars().count() <= 1_000);
    }
}
