use serde_json::Value;

/// Typed failure taxonomy for Moodle web-service calls.
///
/// Moodle conflates transport and application errors in one channel: many
/// failures arrive as HTTP 200 with an error-shaped JSON body, so the body
/// is always inspected before the HTTP status is trusted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MoodleError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Moodle API error ({code}): {message}")]
    Api {
        code: String,
        message: String,
        debug_info: Option<String>,
    },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Write operation blocked: {0}")]
    WriteDenied(String),
}

impl MoodleError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
            debug_info: None,
        }
    }
}

/// Classify a parsed response body. Returns the value back on success, or
/// the typed error when the body carries Moodle's error markers.
///
/// Sub-classification matches on substrings of `errorcode`, not exact codes:
/// Moodle's code vocabulary is open-ended and undocumented codes routinely
/// embed these fragments.
pub fn classify_body(body: Value) -> Result<Value, MoodleError> {
    let Some(obj) = body.as_object() else {
        return Ok(body);
    };
    if !obj.contains_key("exception") && !obj.contains_key("errorcode") {
        return Ok(body);
    }

    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Unknown error")
        .to_string();
    let code = obj
        .get("errorcode")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let debug_info = obj
        .get("debuginfo")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    if code.contains("invalidtoken") || code.contains("accessexception") {
        Err(MoodleError::Auth(message))
    } else if code.contains("nopermission") || code.contains("requireloginerror") {
        Err(MoodleError::Permission(message))
    } else if code.contains("invalidrecord") || code.contains("notfound") {
        Err(MoodleError::NotFound(message))
    } else {
        Err(MoodleError::Api {
            code,
            message,
            debug_info,
        })
    }
}

/// Map an HTTP failure status with no parseable Moodle error body. Anything
/// other than the auth/not-found statuses is treated as a transport-layer
/// fault rather than an API fault.
pub fn classify_status(status: u16) -> MoodleError {
    match status {
        401 | 403 => MoodleError::Auth(format!("HTTP {status}: Authentication failed")),
        404 => MoodleError::NotFound("HTTP 404: Resource not found".to_string()),
        _ => MoodleError::Connection(format!("HTTP error {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_body_overrides_success_status() {
        // Moodle returns these with HTTP 200; classification must not
        // depend on the status at all.
        let err = classify_body(json!({
            "exception": "x",
            "errorcode": "invalidtoken",
            "message": "bad"
        }))
        .unwrap_err();
        assert!(matches!(err, MoodleError::Auth(msg) if msg == "bad"));
    }

    #[test]
    fn requireloginerror_maps_to_permission() {
        let err = classify_body(json!({"errorcode": "requireloginerror", "message": "no"}))
            .unwrap_err();
        assert!(matches!(err, MoodleError::Permission(msg) if msg.contains("no")));
    }

    #[test]
    fn invalidrecord_and_notfound_map_to_not_found() {
        for code in ["invalidrecord", "coursenotfound"] {
            let err =
                classify_body(json!({"errorcode": code, "message": "missing"})).unwrap_err();
            assert!(matches!(err, MoodleError::NotFound(_)), "code {code}");
        }
    }

    #[test]
    fn substring_matching_covers_embedded_codes() {
        let err = classify_body(json!({
            "errorcode": "mod_assign_nopermission_to_grade",
            "message": "denied"
        }))
        .unwrap_err();
        assert!(matches!(err, MoodleError::Permission(_)));
    }

    #[test]
    fn unknown_code_is_generic_api_error_with_debuginfo() {
        let err = classify_body(json!({
            "errorcode": "dmlwriteexception",
            "message": "db failure",
            "debuginfo": "duplicate key"
        }))
        .unwrap_err();
        match err {
            MoodleError::Api {
                code,
                message,
                debug_info,
            } => {
                assert_eq!(code, "dmlwriteexception");
                assert_eq!(message, "db failure");
                assert_eq!(debug_info.as_deref(), Some("duplicate key"));
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn exception_key_alone_marks_an_error() {
        let err = classify_body(json!({"exception": "moodle_exception"})).unwrap_err();
        assert!(matches!(err, MoodleError::Api { .. }));
    }

    #[test]
    fn plain_payloads_pass_through() {
        let body = json!([{"id": 2292, "fullname": "X"}]);
        assert_eq!(classify_body(body.clone()).unwrap(), body);

        // An object without error markers is a success even if it mentions
        // errors in ordinary fields.
        let body = json!({"warnings": [], "message": "ok"});
        assert_eq!(classify_body(body.clone()).unwrap(), body);
    }

    #[test]
    fn http_status_mapping() {
        assert!(matches!(classify_status(401), MoodleError::Auth(_)));
        assert!(matches!(classify_status(403), MoodleError::Auth(_)));
        assert!(matches!(classify_status(404), MoodleError::NotFound(_)));
        assert!(matches!(classify_status(500), MoodleError::Connection(_)));
        assert!(matches!(classify_status(429), MoodleError::Connection(_)));
    }
}
