use serde_json::{Map, Value};

/// Flatten nested parameters into Moodle's bracket-indexed query format.
///
/// Moodle's REST endpoint takes arrays and objects as flat keys:
/// `{"users": [{"id": 1}, {"id": 2}]}` becomes
/// `users[0][id]=1` and `users[1][id]=2`.
///
/// Traversal is depth-first and preserves input order, so the output pairs
/// can be appended to a URL as-is. The function is total over JSON values:
/// every leaf scalar yields exactly one pair and no input shape is an error.
pub fn flatten_params(params: &Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in params {
        flatten_value(&mut pairs, key.clone(), value);
    }
    pairs
}

fn flatten_value(pairs: &mut Vec<(String, String)>, key: String, value: &Value) {
    match value {
        Value::Object(map) => {
            for (child, child_value) in map {
                flatten_value(pairs, format!("{key}[{child}]"), child_value);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_value(pairs, format!("{key}[{index}]"), item);
            }
        }
        scalar => pairs.push((key, scalar_string(scalar))),
    }
}

/// String form of a leaf scalar. Booleans use Moodle's `1`/`0` convention
/// and `null` maps to the empty string.
fn scalar_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        // Handled by the caller; unreachable for leaf scalars.
        Value::Array(_) | Value::Object(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flatten(value: Value) -> Vec<(String, String)> {
        flatten_params(value.as_object().expect("test input must be an object"))
    }

    #[test]
    fn list_of_objects_uses_indexed_bracket_keys() {
        let pairs = flatten(json!({"users": [{"id": 1}, {"id": 2}]}));
        assert_eq!(
            pairs,
            vec![
                ("users[0][id]".to_string(), "1".to_string()),
                ("users[1][id]".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn object_containing_list_nests_index_after_key() {
        let pairs = flatten(json!({"options": {"ids": [2292]}}));
        assert_eq!(
            pairs,
            vec![("options[ids][0]".to_string(), "2292".to_string())]
        );
    }

    #[test]
    fn multi_level_object_nesting_chains_brackets() {
        // Contract test for deep mapping nesting; no closing-bracket
        // pseudo-entries are emitted.
        let pairs = flatten(json!({"a": {"b": {"c": 1}}}));
        assert_eq!(pairs, vec![("a[b][c]".to_string(), "1".to_string())]);
    }

    #[test]
    fn scalar_leaves_have_defined_string_forms() {
        let pairs = flatten(json!({
            "int": 42,
            "float": 1.5,
            "yes": true,
            "no": false,
            "text": "hello",
            "nothing": null
        }));
        assert_eq!(
            pairs,
            vec![
                ("int".to_string(), "42".to_string()),
                ("float".to_string(), "1.5".to_string()),
                ("yes".to_string(), "1".to_string()),
                ("no".to_string(), "0".to_string()),
                ("text".to_string(), "hello".to_string()),
                ("nothing".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn scalar_list_elements_are_indexed_directly() {
        let pairs = flatten(json!({"courseids": [7299, 2292]}));
        assert_eq!(
            pairs,
            vec![
                ("courseids[0]".to_string(), "7299".to_string()),
                ("courseids[1]".to_string(), "2292".to_string()),
            ]
        );
    }

    #[test]
    fn flattening_is_deterministic() {
        let input = json!({
            "enrolments": [
                {"roleid": 5, "userid": 624, "courseid": 7299},
                {"roleid": 5, "userid": 625, "courseid": 7299}
            ],
            "flag": true
        });
        let first = flatten(input.clone());
        let second = flatten(input);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_input_yields_no_pairs() {
        assert!(flatten(json!({})).is_empty());
    }
}
