//! MCP runtime for the Moodle gateway.
//!
//! JSON-RPC 2.0 over stdio with `Content-Length` framing. Tool failures are
//! reported as `tools/call` results with `isError: true`; JSON-RPC protocol
//! errors are reserved for malformed requests and unknown methods. stdout
//! belongs to the protocol, so operational status goes to stderr as JSON
//! event objects.

use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use moodle_core::config::MoodleConfig;
use moodle_core::error::MoodleError;
use moodle_core::MoodleClient;

mod definitions;
mod format;

use definitions::tool_definitions;
use format::{OutputFormat, format_response, truncate_response};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "moodle-mcp";
/// Moodle text format constant for HTML.
const TEXT_FORMAT_HTML: i64 = 1;
/// Manual-enrolment role when the caller does not pick one.
const DEFAULT_ENROL_ROLE_ID: i64 = 5;
/// Forum fan-out cap: discussions are fetched from at most this many forums
/// per course to keep one tool call from issuing unbounded requests.
const FORUM_FANOUT_LIMIT: usize = 5;

/// Build the client, emit startup status, and serve MCP over stdio until
/// stdin closes. Returns the process exit code.
pub async fn run(config: MoodleConfig, skip_connection_check: bool) -> i32 {
    let client = match MoodleClient::new(&config) {
        Ok(client) => client,
        Err(err) => {
            emit_status(&json!({
                "event": "moodle_mcp_startup_failed",
                "error": err.to_string(),
            }));
            return 1;
        }
    };

    let server = McpServer::new(client, config);
    server.emit_startup_status();
    if !skip_connection_check {
        server.check_connection().await;
    }

    let outcome = server.serve_stdio().await;
    server.client.close();
    match outcome {
        Ok(()) => 0,
        Err(err) => {
            emit_status(&json!({
                "event": "moodle_mcp_server_error",
                "message": err,
            }));
            1
        }
    }
}

fn emit_status(payload: &Value) {
    eprintln!("{}", to_pretty_json(payload));
}

struct McpServer {
    config: MoodleConfig,
    client: MoodleClient,
    session_id: String,
}

impl McpServer {
    fn new(client: MoodleClient, config: MoodleConfig) -> Self {
        Self {
            config,
            client,
            session_id: format!("stdio-{}", Uuid::now_v7()),
        }
    }

    fn emit_startup_status(&self) {
        let policy = &self.config.write_policy;
        let mut allowlist: Vec<i64> = policy.dev_course_allowlist.iter().copied().collect();
        allowlist.sort_unstable();
        emit_status(&json!({
            "event": "moodle_mcp_startup",
            "server": MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "session": self.session_id,
            "environment": self.config.environment().name(),
            "write_policy": {
                "dev_course_allowlist": allowlist,
                "prod_allow_writes": policy.prod_allow_writes,
            },
        }));
        if self.config.environment().is_production() {
            emit_status(&json!({
                "event": "moodle_mcp_production_warning",
                "message": "Connected to the PRODUCTION Moodle instance. Write tools are blocked unless MOODLE_PROD_ALLOW_WRITES is set.",
            }));
        }
    }

    /// One live round trip at startup. A failure is reported but does not
    /// abort the serve loop: the site may come back before the first tool
    /// call, and every call re-surfaces transport errors anyway.
    async fn check_connection(&self) {
        match self.client.site_info().await {
            Ok(info) => emit_status(&json!({
                "event": "moodle_mcp_connected",
                "sitename": info.get("sitename").cloned().unwrap_or(Value::Null),
                "username": info.get("username").cloned().unwrap_or(Value::Null),
                "release": info.get("release").cloned().unwrap_or(Value::Null),
            })),
            Err(err) => emit_status(&json!({
                "event": "moodle_mcp_connection_warning",
                "error": err.to_string(),
            })),
        }
    }

    async fn serve_stdio(&self) -> Result<(), String> {
        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Most likely a client response; this server issues no outbound requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method, params);
            None
        }
    }

    fn handle_notification(&self, method: &str, _params: Value) {
        if matches!(
            method,
            "notifications/initialized" | "notifications/cancelled"
        ) {
            return;
        }
        // Unknown notifications are intentionally ignored.
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        let environment = self.config.environment().name();
        let instructions = format!(
            "Gateway to a Moodle LMS ({environment} instance). Start with moodle_get_site_info to confirm connectivity and the authenticated identity. Read tools return Markdown by default; pass format=\"json\" for raw payloads. Write tools are policy-gated: in DEVELOPMENT they only touch allow-listed courses, in PRODUCTION they are blocked unless writes were explicitly enabled at startup. Blocked writes explain the active policy in their error."
        );
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": instructions
        })
    }

    fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = tool_definitions()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        Ok(match self.execute_tool(name, &args).await {
            Ok(text) => {
                let text = truncate_response(text, self.config.max_response_chars);
                json!({
                    "content": [{ "type": "text", "text": text }]
                })
            }
            Err(err) => json!({
                "isError": true,
                "content": [{ "type": "text", "text": err.render() }],
                "structuredContent": err.to_value()
            }),
        })
    }

    async fn execute_tool(&self, name: &str, args: &Map<String, Value>) -> Result<String, ToolError> {
        match name {
            "moodle_get_site_info" => self.tool_get_site_info(args).await,
            "moodle_get_available_functions" => self.tool_get_available_functions(args).await,
            "moodle_get_user_profile" => self.tool_get_user_profile(args).await,
            "moodle_search_users" => self.tool_search_users(args).await,
            "moodle_list_user_courses" => self.tool_list_user_courses(args).await,
            "moodle_get_course_details" => self.tool_get_course_details(args).await,
            "moodle_search_courses" => self.tool_search_courses(args).await,
            "moodle_get_course_contents" => self.tool_get_course_contents(args).await,
            "moodle_get_enrolled_users" => self.tool_get_enrolled_users(args).await,
            "moodle_get_course_categories" => self.tool_get_course_categories(args).await,
            "moodle_list_assignments" => self.tool_list_assignments(args).await,
            "moodle_get_assignment_submissions" => self.tool_get_assignment_submissions(args).await,
            "moodle_get_submission_status" => self.tool_get_submission_status(args).await,
            "moodle_get_user_grades" => self.tool_get_user_grades(args).await,
            "moodle_get_grade_items" => self.tool_get_grade_items(args).await,
            "moodle_get_gradebook_overview" => self.tool_get_gradebook_overview(args).await,
            "moodle_get_calendar_events" => self.tool_get_calendar_events(args).await,
            "moodle_get_quizzes" => self.tool_get_quizzes(args).await,
            "moodle_get_quiz_attempts" => self.tool_get_quiz_attempts(args).await,
            "moodle_get_forum_discussions" => self.tool_get_forum_discussions(args).await,
            "moodle_get_discussion_posts" => self.tool_get_discussion_posts(args).await,
            "moodle_get_conversations" => self.tool_get_conversations(args).await,
            "moodle_get_unread_count" => self.tool_get_unread_count(args).await,
            "moodle_get_course_groups" => self.tool_get_course_groups(args).await,
            "moodle_get_group_members" => self.tool_get_group_members(args).await,
            "moodle_get_user_badges" => self.tool_get_user_badges(args).await,
            "moodle_get_activities_completion_status" => {
                self.tool_get_activities_completion_status(args).await
            }
            "moodle_get_course_completion_status" => {
                self.tool_get_course_completion_status(args).await
            }
            "moodle_create_course" => self.tool_create_course(args).await,
            "moodle_update_course" => self.tool_update_course(args).await,
            "moodle_delete_course" => self.tool_delete_course(args).await,
            "moodle_duplicate_course" => self.tool_duplicate_course(args).await,
            "moodle_import_course_content" => self.tool_import_course_content(args).await,
            "moodle_enrol_users" => self.tool_enrol_users(args).await,
            "moodle_unenrol_users" => self.tool_unenrol_users(args).await,
            "moodle_save_assignment_submission" => {
                self.tool_save_assignment_submission(args).await
            }
            "moodle_submit_assignment" => self.tool_submit_assignment(args).await,
            "moodle_save_assignment_grade" => self.tool_save_assignment_grade(args).await,
            "moodle_update_grades" => self.tool_update_grades(args).await,
            "moodle_create_calendar_event" => self.tool_create_calendar_event(args).await,
            "moodle_delete_calendar_event" => self.tool_delete_calendar_event(args).await,
            "moodle_mark_course_self_completed" => {
                self.tool_mark_course_self_completed(args).await
            }
            "moodle_create_groups" => self.tool_create_groups(args).await,
            "moodle_create_forum_discussion" => self.tool_create_forum_discussion(args).await,
            "moodle_send_message" => self.tool_send_message(args).await,
            _ => Err(ToolError::new("unknown_tool", format!("Unknown tool: {name}"))
                .with_field("name")
                .with_docs_hint("Call tools/list for the available tool names.")),
        }
    }

    // ----------------------------------------------------------------------
    // Shared plumbing
    // ----------------------------------------------------------------------

    /// Call a web-service function with a nested parameter object; the
    /// transport layer flattens it to Moodle's bracket form.
    async fn rpc(&self, function: &str, params: Value) -> Result<Value, ToolError> {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.client
            .call(function, &params)
            .await
            .map_err(|err| self.tool_error(err))
    }

    /// Map a transport/API error into the tool-facing shape, attaching
    /// remediation hints per kind. `debuginfo` is only surfaced outside
    /// production.
    fn tool_error(&self, err: MoodleError) -> ToolError {
        let message = err.to_string();
        match err {
            MoodleError::Auth(_) => ToolError::new("authentication_failed", message)
                .with_docs_hint(
                    "Verify the Moodle token is correct and not expired, has the required web service permissions, and that web services are enabled on the site.",
                ),
            MoodleError::Permission(_) => ToolError::new("permission_denied", message)
                .with_docs_hint(
                    "The current user lacks permission for this operation. Try a different account or contact the Moodle administrator.",
                ),
            MoodleError::NotFound(_) => ToolError::new("not_found", message)
                .with_docs_hint("Verify the ID is correct and the resource exists."),
            MoodleError::Connection(_) => ToolError::new("connection_error", message)
                .with_docs_hint(
                    "Verify the Moodle URL is correct and reachable, the network is stable, and the site is online.",
                ),
            MoodleError::Api { code, debug_info, .. } => {
                let mut details = json!({ "errorcode": code });
                if let Some(debug) = debug_info {
                    if !self.config.environment().is_production() {
                        details["debuginfo"] = json!(debug);
                    }
                }
                ToolError::new("moodle_api_error", message).with_details(details)
            }
            MoodleError::Validation(_) => ToolError::new("validation_failed", message),
            MoodleError::WriteDenied(_) => ToolError::new("write_blocked", message)
                .with_docs_hint(
                    "Adjust MOODLE_DEV_COURSE_WHITELIST (development) or MOODLE_PROD_ALLOW_WRITES (production) if this write is intended.",
                ),
        }
    }

    /// Resolve an optional user id to the authenticated user's id.
    async fn resolve_user_id(&self, user_id: Option<i64>) -> Result<i64, ToolError> {
        if let Some(id) = user_id {
            return Ok(id);
        }
        let info = self
            .client
            .site_info()
            .await
            .map_err(|err| self.tool_error(err))?;
        info.get("userid").and_then(Value::as_i64).ok_or_else(|| {
            ToolError::new(
                "moodle_api_error",
                "Site info response did not include a user id",
            )
        })
    }

    fn guard_course_write(&self, course_id: i64) -> Result<(), ToolError> {
        self.config
            .write_policy
            .require_write(course_id)
            .map_err(|err| self.tool_error(err))
    }

    fn guard_mode_write(&self) -> Result<(), ToolError> {
        self.config
            .write_policy
            .require_write_mode()
            .map_err(|err| self.tool_error(err))
    }

    // ----------------------------------------------------------------------
    // Site and users
    // ----------------------------------------------------------------------

    async fn tool_get_site_info(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let mut info = self.rpc("core_webservice_get_site_info", json!({})).await?;
        // The functions list dominates the payload; collapse it to a count
        // here and let moodle_get_available_functions serve the full list.
        if let Some(obj) = info.as_object_mut() {
            if let Some(functions) = obj.remove("functions") {
                let count = functions.as_array().map(Vec::len).unwrap_or(0);
                obj.insert("available_functions".to_string(), json!(count));
            }
        }
        Ok(format_response(&info, Some("Moodle Site Information"), fmt))
    }

    async fn tool_get_available_functions(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let info = self.rpc("core_webservice_get_site_info", json!({})).await?;
        let functions = info.get("functions").cloned().unwrap_or_else(|| json!([]));
        let total = functions.as_array().map(Vec::len).unwrap_or(0);
        let payload = json!({ "total": total, "functions": functions });
        Ok(format_response(
            &payload,
            Some("Available Web Service Functions"),
            fmt,
        ))
    }

    async fn tool_get_user_profile(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let user_id = required_i64(args, "user_id")?;
        let users = self
            .rpc(
                "core_user_get_users_by_field",
                json!({ "field": "id", "values": [user_id] }),
            )
            .await?;
        let user = users
            .as_array()
            .and_then(|list| list.first())
            .cloned()
            .ok_or_else(|| {
                ToolError::new("not_found", format!("User {user_id} not found"))
                    .with_field("user_id")
            })?;
        Ok(format_response(
            &user,
            Some(&format!("User Profile: {user_id}")),
            fmt,
        ))
    }

    async fn tool_search_users(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let query = required_string(args, "query")?;
        let limit = arg_optional_i64(args, "limit")?.unwrap_or(20).max(1) as usize;
        let result = self
            .rpc(
                "core_user_get_users",
                json!({ "criteria": [{ "key": "fullname", "value": query }] }),
            )
            .await?;
        let mut users = result
            .get("users")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        users.truncate(limit);
        if users.is_empty() {
            return Ok(format!("No users found matching '{query}'."));
        }
        Ok(format_response(
            &Value::Array(users),
            Some(&format!("User Search: '{query}'")),
            fmt,
        ))
    }

    // ----------------------------------------------------------------------
    // Courses
    // ----------------------------------------------------------------------

    async fn tool_list_user_courses(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let user_id = self
            .resolve_user_id(arg_optional_i64(args, "user_id")?)
            .await?;
        let courses = self
            .rpc("core_enrol_get_users_courses", json!({ "userid": user_id }))
            .await?;
        Ok(format_response(
            &courses,
            Some(&format!("Enrolled Courses (User {user_id})")),
            fmt,
        ))
    }

    async fn tool_get_course_details(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let courses = self
            .rpc(
                "core_course_get_courses",
                json!({ "options": { "ids": [course_id] } }),
            )
            .await?;
        let course = courses
            .as_array()
            .and_then(|list| list.first())
            .cloned()
            .ok_or_else(|| {
                ToolError::new("not_found", format!("Course {course_id} not found"))
                    .with_field("course_id")
            })?;
        Ok(format_response(
            &course,
            Some(&format!("Course Details: {course_id}")),
            fmt,
        ))
    }

    async fn tool_search_courses(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let query = required_string(args, "query")?;
        let result = self
            .rpc(
                "core_course_search_courses",
                json!({ "criterianame": "search", "criteriavalue": query }),
            )
            .await?;
        let courses = result.get("courses").cloned().unwrap_or_else(|| json!([]));
        if courses.as_array().is_some_and(Vec::is_empty) {
            return Ok(format!("No courses found matching '{query}'."));
        }
        Ok(format_response(
            &courses,
            Some(&format!("Course Search: '{query}'")),
            fmt,
        ))
    }

    async fn tool_get_course_contents(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let contents = self
            .rpc("core_course_get_contents", json!({ "courseid": course_id }))
            .await?;
        Ok(format_response(
            &contents,
            Some(&format!("Course Contents (Course {course_id})")),
            fmt,
        ))
    }

    async fn tool_get_enrolled_users(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let users = self
            .rpc(
                "core_enrol_get_enrolled_users",
                json!({ "courseid": course_id }),
            )
            .await?;
        Ok(format_response(
            &users,
            Some(&format!("Enrolled Users (Course {course_id})")),
            fmt,
        ))
    }

    async fn tool_get_course_categories(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let categories = self.rpc("core_course_get_categories", json!({})).await?;
        Ok(format_response(&categories, Some("Course Categories"), fmt))
    }

    // ----------------------------------------------------------------------
    // Assignments
    // ----------------------------------------------------------------------

    async fn tool_list_assignments(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let result = self
            .rpc(
                "mod_assign_get_assignments",
                json!({ "courseids": [course_id] }),
            )
            .await?;
        let assignments = result
            .pointer("/courses/0/assignments")
            .cloned()
            .unwrap_or_else(|| json!([]));
        if assignments.as_array().is_some_and(Vec::is_empty) {
            return Ok(format!("No assignments found in course {course_id}."));
        }
        Ok(format_response(
            &assignments,
            Some(&format!("Assignments (Course {course_id})")),
            fmt,
        ))
    }

    async fn tool_get_assignment_submissions(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let assignment_id = required_i64(args, "assignment_id")?;
        let result = self
            .rpc(
                "mod_assign_get_submissions",
                json!({ "assignmentids": [assignment_id] }),
            )
            .await?;
        let submissions = result
            .pointer("/assignments/0/submissions")
            .cloned()
            .unwrap_or_else(|| json!([]));
        if submissions.as_array().is_some_and(Vec::is_empty) {
            return Ok(format!(
                "No submissions found for assignment {assignment_id}."
            ));
        }
        Ok(format_response(
            &submissions,
            Some(&format!("Submissions (Assignment {assignment_id})")),
            fmt,
        ))
    }

    async fn tool_get_submission_status(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let assignment_id = required_i64(args, "assignment_id")?;
        let user_id = self
            .resolve_user_id(arg_optional_i64(args, "user_id")?)
            .await?;
        let status = self
            .rpc(
                "mod_assign_get_submission_status",
                json!({ "assignid": assignment_id, "userid": user_id }),
            )
            .await?;
        Ok(format_response(
            &status,
            Some(&format!("Submission Status (Assignment {assignment_id})")),
            fmt,
        ))
    }

    // ----------------------------------------------------------------------
    // Grades
    // ----------------------------------------------------------------------

    async fn tool_get_user_grades(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let user_id = self
            .resolve_user_id(arg_optional_i64(args, "user_id")?)
            .await?;
        let grades = self
            .rpc(
                "gradereport_user_get_grade_items",
                json!({ "courseid": course_id, "userid": user_id }),
            )
            .await?;
        Ok(format_response(
            &grades,
            Some(&format!("Grades (Course {course_id}, User {user_id})")),
            fmt,
        ))
    }

    async fn tool_get_grade_items(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let items = self
            .rpc("core_grades_get_gradeitems", json!({ "courseid": course_id }))
            .await?;
        Ok(format_response(
            &items,
            Some(&format!("Grade Items (Course {course_id})")),
            fmt,
        ))
    }

    async fn tool_get_gradebook_overview(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let user_id = self
            .resolve_user_id(arg_optional_i64(args, "user_id")?)
            .await?;
        let overview = self
            .rpc(
                "gradereport_overview_get_course_grades",
                json!({ "userid": user_id }),
            )
            .await?;
        Ok(format_response(
            &overview,
            Some(&format!("Gradebook Overview (User {user_id})")),
            fmt,
        ))
    }

    // ----------------------------------------------------------------------
    // Calendar
    // ----------------------------------------------------------------------

    async fn tool_get_calendar_events(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        // Clamped so the window arithmetic can never overflow.
        let days_ahead = arg_optional_i64(args, "days_ahead")?
            .unwrap_or(30)
            .clamp(1, 3650);
        let now = chrono::Utc::now().timestamp();
        let end = now + days_ahead * 86_400;
        let result = self
            .rpc(
                "core_calendar_get_calendar_events",
                json!({ "options": { "timestart": now, "timeend": end } }),
            )
            .await?;
        let events = result.get("events").cloned().unwrap_or_else(|| json!([]));
        if events.as_array().is_some_and(Vec::is_empty) {
            return Ok(format!(
                "No calendar events found for the next {days_ahead} days."
            ));
        }
        Ok(format_response(
            &events,
            Some(&format!("Calendar Events (Next {days_ahead} Days)")),
            fmt,
        ))
    }

    // ----------------------------------------------------------------------
    // Quizzes
    // ----------------------------------------------------------------------

    async fn tool_get_quizzes(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let result = self
            .rpc(
                "mod_quiz_get_quizzes_by_courses",
                json!({ "courseids": [course_id] }),
            )
            .await?;
        let quizzes = result.get("quizzes").cloned().unwrap_or_else(|| json!([]));
        if quizzes.as_array().is_some_and(Vec::is_empty) {
            return Ok(format!("No quizzes found in course {course_id}."));
        }
        Ok(format_response(
            &quizzes,
            Some(&format!("Quizzes (Course {course_id})")),
            fmt,
        ))
    }

    async fn tool_get_quiz_attempts(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let quiz_id = required_i64(args, "quiz_id")?;
        let user_id = self
            .resolve_user_id(arg_optional_i64(args, "user_id")?)
            .await?;
        let result = self
            .rpc(
                "mod_quiz_get_user_attempts",
                json!({ "quizid": quiz_id, "userid": user_id }),
            )
            .await?;
        let attempts = result.get("attempts").cloned().unwrap_or_else(|| json!([]));
        if attempts.as_array().is_some_and(Vec::is_empty) {
            return Ok(format!("No attempts found for quiz {quiz_id}."));
        }
        Ok(format_response(
            &attempts,
            Some(&format!("Quiz Attempts (Quiz {quiz_id})")),
            fmt,
        ))
    }

    // ----------------------------------------------------------------------
    // Forums
    // ----------------------------------------------------------------------

    async fn tool_get_forum_discussions(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let limit = arg_optional_i64(args, "limit")?.unwrap_or(10).max(1);

        let forums = self
            .rpc(
                "mod_forum_get_forums_by_courses",
                json!({ "courseids": [course_id] }),
            )
            .await?;
        let forums = forums.as_array().cloned().unwrap_or_default();
        if forums.is_empty() {
            return Ok(format!("No forums found in course {course_id}."));
        }

        // A forum that errors (hidden, no access) is skipped rather than
        // failing the whole listing.
        let mut discussions = Vec::new();
        for forum in forums.iter().take(FORUM_FANOUT_LIMIT) {
            let Some(forum_id) = forum.get("id").and_then(Value::as_i64) else {
                continue;
            };
            let forum_name = forum
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("Unknown Forum")
                .to_string();
            let Ok(result) = self
                .rpc(
                    "mod_forum_get_forum_discussions",
                    json!({ "forumid": forum_id, "perpage": limit }),
                )
                .await
            else {
                continue;
            };
            if let Some(list) = result.get("discussions").and_then(Value::as_array) {
                for discussion in list {
                    let mut discussion = discussion.clone();
                    if let Some(obj) = discussion.as_object_mut() {
                        obj.insert("forumname".to_string(), json!(forum_name));
                    }
                    discussions.push(discussion);
                }
            }
        }

        if discussions.is_empty() {
            return Ok(format!("No discussions found in course {course_id}."));
        }
        Ok(format_response(
            &Value::Array(discussions),
            Some(&format!("Forum Discussions (Course {course_id})")),
            fmt,
        ))
    }

    async fn tool_get_discussion_posts(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let discussion_id = required_i64(args, "discussion_id")?;
        let result = self
            .rpc(
                "mod_forum_get_discussion_posts",
                json!({ "discussionid": discussion_id }),
            )
            .await?;
        let posts = result.get("posts").cloned().unwrap_or_else(|| json!([]));
        if posts.as_array().is_some_and(Vec::is_empty) {
            return Ok(format!("No posts found in discussion {discussion_id}."));
        }
        Ok(format_response(
            &posts,
            Some(&format!("Discussion Posts (Discussion {discussion_id})")),
            fmt,
        ))
    }

    // ----------------------------------------------------------------------
    // Messaging
    // ----------------------------------------------------------------------

    async fn tool_get_conversations(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let limit = arg_optional_i64(args, "limit")?.unwrap_or(20).max(1);
        let offset = arg_optional_i64(args, "offset")?.unwrap_or(0).max(0);
        // userid 0 means the authenticated user.
        let result = self
            .rpc(
                "core_message_get_conversations",
                json!({ "userid": 0, "limitfrom": offset, "limitnum": limit }),
            )
            .await?;
        let conversations = result
            .get("conversations")
            .cloned()
            .unwrap_or_else(|| json!([]));
        if conversations.as_array().is_some_and(Vec::is_empty) {
            return Ok("No conversations found.".to_string());
        }
        Ok(format_response(&conversations, Some("Conversations"), fmt))
    }

    async fn tool_get_unread_count(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let count = self
            .rpc(
                "core_message_get_unread_conversations_count",
                json!({ "useridto": 0 }),
            )
            .await?;
        let payload = json!({ "unread_conversations": count });
        Ok(format_response(&payload, Some("Unread Messages"), fmt))
    }

    // ----------------------------------------------------------------------
    // Groups
    // ----------------------------------------------------------------------

    async fn tool_get_course_groups(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let groups = self
            .rpc(
                "core_group_get_course_groups",
                json!({ "courseid": course_id }),
            )
            .await?;
        if groups.as_array().is_some_and(Vec::is_empty) {
            return Ok(format!("No groups found in course {course_id}."));
        }
        Ok(format_response(
            &groups,
            Some(&format!("Groups (Course {course_id})")),
            fmt,
        ))
    }

    async fn tool_get_group_members(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let group_id = required_i64(args, "group_id")?;
        let result = self
            .rpc(
                "core_group_get_group_members",
                json!({ "groupids": [group_id] }),
            )
            .await?;
        let members = result
            .pointer("/0/userids")
            .cloned()
            .unwrap_or_else(|| json!([]));
        let payload = json!({
            "group_id": group_id,
            "member_count": members.as_array().map(Vec::len).unwrap_or(0),
            "members": members
        });
        Ok(format_response(
            &payload,
            Some(&format!("Group Members (Group {group_id})")),
            fmt,
        ))
    }

    // ----------------------------------------------------------------------
    // Badges and completion
    // ----------------------------------------------------------------------

    async fn tool_get_user_badges(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let mut params = Map::new();
        // userid 0 means the authenticated user.
        params.insert(
            "userid".to_string(),
            json!(arg_optional_i64(args, "user_id")?.unwrap_or(0)),
        );
        if let Some(course_id) = arg_optional_i64(args, "course_id")? {
            params.insert("courseid".to_string(), json!(course_id));
        }
        if let Some(search) = arg_optional_string(args, "search")? {
            params.insert("search".to_string(), json!(search));
        }
        let result = self
            .rpc("core_badges_get_user_badges", Value::Object(params))
            .await?;
        Ok(format_response(&result, Some("User Badges"), fmt))
    }

    async fn tool_get_activities_completion_status(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let user_id = self
            .resolve_user_id(arg_optional_i64(args, "user_id")?)
            .await?;
        let result = self
            .rpc(
                "core_completion_get_activities_completion_status",
                json!({ "courseid": course_id, "userid": user_id }),
            )
            .await?;
        Ok(format_response(&result, Some("Activity Completion Status"), fmt))
    }

    async fn tool_get_course_completion_status(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        let user_id = self
            .resolve_user_id(arg_optional_i64(args, "user_id")?)
            .await?;
        let result = self
            .rpc(
                "core_completion_get_course_completion_status",
                json!({ "courseid": course_id, "userid": user_id }),
            )
            .await?;
        Ok(format_response(&result, Some("Course Completion Status"), fmt))
    }

    // ----------------------------------------------------------------------
    // Write operations
    // ----------------------------------------------------------------------

    async fn tool_create_course(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        // No course exists yet, so the gate is mode-level only.
        self.guard_mode_write()?;
        let fullname = required_string(args, "fullname")?;
        let shortname = required_string(args, "shortname")?;
        let category_id = required_i64(args, "category_id")?;
        let course_format =
            arg_optional_string(args, "course_format")?.unwrap_or_else(|| "topics".to_string());
        let visible = arg_optional_bool(args, "visible")?.unwrap_or(true);

        let mut course = Map::new();
        course.insert("fullname".to_string(), json!(fullname));
        course.insert("shortname".to_string(), json!(shortname));
        course.insert("categoryid".to_string(), json!(category_id));
        course.insert("format".to_string(), json!(course_format));
        course.insert("visible".to_string(), json!(if visible { 1 } else { 0 }));
        if let Some(summary) = arg_optional_string(args, "summary")? {
            course.insert("summary".to_string(), json!(summary));
        }

        let result = self
            .rpc("core_course_create_courses", json!({ "courses": [course] }))
            .await?;
        let new_id = result.pointer("/0/id").cloned().unwrap_or(Value::Null);
        let payload = json!({
            "course_id": new_id,
            "fullname": fullname,
            "shortname": shortname,
            "created": true
        });
        Ok(format_response(&payload, Some("Course Created"), fmt))
    }

    async fn tool_update_course(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;

        let mut course = Map::new();
        course.insert("id".to_string(), json!(course_id));
        if let Some(fullname) = arg_optional_string(args, "fullname")? {
            course.insert("fullname".to_string(), json!(fullname));
        }
        if let Some(shortname) = arg_optional_string(args, "shortname")? {
            course.insert("shortname".to_string(), json!(shortname));
        }
        if let Some(summary) = arg_optional_string(args, "summary")? {
            course.insert("summary".to_string(), json!(summary));
        }
        if let Some(visible) = arg_optional_bool(args, "visible")? {
            course.insert("visible".to_string(), json!(if visible { 1 } else { 0 }));
        }
        if course.len() == 1 {
            return Err(ToolError::new(
                "validation_failed",
                "No updates specified; provide at least one field to change",
            ));
        }

        self.rpc("core_course_update_courses", json!({ "courses": [course] }))
            .await?;
        let payload = json!({ "course_id": course_id, "updated": true });
        Ok(format_response(
            &payload,
            Some(&format!("Course {course_id} Updated")),
            fmt,
        ))
    }

    async fn tool_delete_course(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;

        self.rpc(
            "core_course_delete_courses",
            json!({ "courseids": [course_id] }),
        )
        .await?;
        let payload = json!({
            "course_id": course_id,
            "deleted": true,
            "warning": "Course has been permanently deleted"
        });
        Ok(format_response(
            &payload,
            Some(&format!("Course {course_id} Deleted")),
            fmt,
        ))
    }

    async fn tool_duplicate_course(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let fullname = required_string(args, "fullname")?;
        let shortname = required_string(args, "shortname")?;
        let category_id = required_i64(args, "category_id")?;
        let visible = arg_optional_bool(args, "visible")?.unwrap_or(true);

        let result = self
            .rpc(
                "core_course_duplicate_course",
                json!({
                    "courseid": course_id,
                    "fullname": fullname,
                    "shortname": shortname,
                    "categoryid": category_id,
                    "visible": if visible { 1 } else { 0 }
                }),
            )
            .await?;
        let payload = json!({
            "source_course_id": course_id,
            "new_course_id": result.get("id").cloned().unwrap_or(Value::Null),
            "fullname": fullname,
            "shortname": shortname
        });
        Ok(format_response(&payload, Some("Course Duplicated"), fmt))
    }

    async fn tool_import_course_content(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let source = required_i64(args, "source_course_id")?;
        let dest = required_i64(args, "dest_course_id")?;
        // Both sides mutate course state, so both must pass the gate.
        self.guard_course_write(source)?;
        self.guard_course_write(dest)?;

        self.rpc(
            "core_course_import_course",
            json!({ "importfrom": source, "importto": dest, "deletecontent": 0 }),
        )
        .await?;
        let payload = json!({
            "source_course_id": source,
            "dest_course_id": dest,
            "imported": true
        });
        Ok(format_response(&payload, Some("Course Content Imported"), fmt))
    }

    async fn tool_enrol_users(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let user_ids = required_i64_array(args, "user_ids")?;
        let role_id = arg_optional_i64(args, "role_id")?.unwrap_or(DEFAULT_ENROL_ROLE_ID);

        let enrolments: Vec<Value> = user_ids
            .iter()
            .map(|user_id| {
                json!({ "roleid": role_id, "userid": user_id, "courseid": course_id })
            })
            .collect();
        self.rpc("enrol_manual_enrol_users", json!({ "enrolments": enrolments }))
            .await?;

        let payload = json!({
            "course_id": course_id,
            "users_enrolled": user_ids.len(),
            "user_ids": user_ids,
            "role": role_name(role_id),
            "role_id": role_id
        });
        Ok(format_response(&payload, Some("Users Enrolled"), fmt))
    }

    async fn tool_unenrol_users(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let user_ids = required_i64_array(args, "user_ids")?;

        let enrolments: Vec<Value> = user_ids
            .iter()
            .map(|user_id| json!({ "userid": user_id, "courseid": course_id }))
            .collect();
        self.rpc(
            "enrol_manual_unenrol_users",
            json!({ "enrolments": enrolments }),
        )
        .await?;

        let payload = json!({
            "course_id": course_id,
            "users_unenrolled": user_ids.len(),
            "user_ids": user_ids
        });
        Ok(format_response(&payload, Some("Users Unenrolled"), fmt))
    }

    async fn tool_save_assignment_submission(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let assignment_id = required_i64(args, "assignment_id")?;
        let submission_text = required_string(args, "submission_text")?;

        self.rpc(
            "mod_assign_save_submission",
            json!({
                "assignmentid": assignment_id,
                "plugindata": {
                    "onlinetext_editor": {
                        "text": submission_text,
                        "format": TEXT_FORMAT_HTML,
                        "itemid": 0
                    }
                }
            }),
        )
        .await?;

        let payload = json!({
            "assignment_id": assignment_id,
            "course_id": course_id,
            "saved": true,
            "status": "draft"
        });
        Ok(format_response(
            &payload,
            Some("Assignment Submission Saved (Draft)"),
            fmt,
        ))
    }

    async fn tool_submit_assignment(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let assignment_id = required_i64(args, "assignment_id")?;

        self.rpc(
            "mod_assign_submit_for_grading",
            json!({ "assignmentid": assignment_id }),
        )
        .await?;

        let payload = json!({
            "assignment_id": assignment_id,
            "course_id": course_id,
            "submitted": true
        });
        Ok(format_response(
            &payload,
            Some("Assignment Submitted for Grading"),
            fmt,
        ))
    }

    async fn tool_save_assignment_grade(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let assignment_id = required_i64(args, "assignment_id")?;
        let user_id = required_i64(args, "user_id")?;
        let grade = required_f64(args, "grade")?;

        let mut params = Map::new();
        params.insert("assignmentid".to_string(), json!(assignment_id));
        params.insert("userid".to_string(), json!(user_id));
        params.insert("grade".to_string(), json!(grade));
        // Grade the most recent attempt and release it to the student.
        params.insert("attemptnumber".to_string(), json!(-1));
        params.insert("addattempt".to_string(), json!(0));
        params.insert("workflowstate".to_string(), json!("released"));
        params.insert("applytoall".to_string(), json!(0));
        if let Some(feedback) = arg_optional_string(args, "feedback_text")? {
            params.insert(
                "plugindata".to_string(),
                json!({
                    "assignfeedbackcomments_editor": {
                        "text": feedback,
                        "format": TEXT_FORMAT_HTML
                    }
                }),
            );
        }

        self.rpc("mod_assign_save_grade", Value::Object(params)).await?;
        let payload = json!({
            "assignment_id": assignment_id,
            "user_id": user_id,
            "grade": grade,
            "graded": true
        });
        Ok(format_response(&payload, Some("Assignment Graded"), fmt))
    }

    async fn tool_update_grades(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let item_name = required_string(args, "item_name")?;
        let entries = required_array(args, "grades")?;

        let mut grades = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            let obj = entry.as_object().ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    format!("grades[{idx}] must be an object with userid and grade"),
                )
                .with_field("grades")
            })?;
            let user_id = obj.get("userid").and_then(Value::as_i64).ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    format!("grades[{idx}] is missing integer 'userid'"),
                )
                .with_field("grades")
            })?;
            let grade = obj.get("grade").and_then(Value::as_f64).ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    format!("grades[{idx}] is missing numeric 'grade'"),
                )
                .with_field("grades")
            })?;
            grades.push(json!({ "userid": user_id, "grade": grade }));
        }

        self.rpc(
            "core_grades_update_grades",
            json!({
                "source": MCP_SERVER_NAME,
                "courseid": course_id,
                "component": "mod_assign",
                "activityname": item_name,
                "grades": grades
            }),
        )
        .await?;

        let payload = json!({
            "course_id": course_id,
            "item_name": item_name,
            "grades_updated": grades.len(),
            "success": true
        });
        Ok(format_response(&payload, Some("Grades Updated"), fmt))
    }

    async fn tool_create_calendar_event(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let name = required_string(args, "name")?;
        let time_start = required_i64(args, "time_start")?;
        let duration = arg_optional_i64(args, "duration")?.unwrap_or(0).max(0);

        let mut event = Map::new();
        event.insert("name".to_string(), json!(name));
        event.insert("courseid".to_string(), json!(course_id));
        event.insert("eventtype".to_string(), json!("course"));
        event.insert("timestart".to_string(), json!(time_start));
        event.insert("timeduration".to_string(), json!(duration));
        event.insert("visible".to_string(), json!(1));
        if let Some(description) = arg_optional_string(args, "description")? {
            event.insert("description".to_string(), json!(description));
            event.insert("format".to_string(), json!(TEXT_FORMAT_HTML));
        }

        let result = self
            .rpc(
                "core_calendar_create_calendar_events",
                json!({ "events": [event] }),
            )
            .await?;
        let event_id = result.pointer("/events/0/id").cloned().unwrap_or(Value::Null);
        let payload = json!({
            "event_id": event_id,
            "course_id": course_id,
            "name": name,
            "created": true
        });
        Ok(format_response(&payload, Some("Calendar Event Created"), fmt))
    }

    async fn tool_delete_calendar_event(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let event_id = required_i64(args, "event_id")?;
        let delete_repeats = arg_optional_bool(args, "delete_repeats")?.unwrap_or(false);

        self.rpc(
            "core_calendar_delete_calendar_events",
            json!({
                "events": [{
                    "eventid": event_id,
                    "repeat": if delete_repeats { 1 } else { 0 }
                }]
            }),
        )
        .await?;
        let payload = json!({ "event_id": event_id, "deleted": true });
        Ok(format_response(&payload, Some("Calendar Event Deleted"), fmt))
    }

    async fn tool_mark_course_self_completed(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;

        self.rpc(
            "core_completion_mark_course_self_completed",
            json!({ "courseid": course_id }),
        )
        .await?;
        let payload = json!({ "course_id": course_id, "marked_completed": true });
        Ok(format_response(&payload, Some("Course Marked Completed"), fmt))
    }

    async fn tool_create_groups(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let entries = required_array(args, "groups")?;

        let mut groups = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            let obj = entry.as_object().ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    format!("groups[{idx}] must be an object with a 'name'"),
                )
                .with_field("groups")
            })?;
            let name = obj.get("name").and_then(Value::as_str).ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    format!("groups[{idx}] is missing string 'name'"),
                )
                .with_field("groups")
            })?;
            let mut group = Map::new();
            group.insert("courseid".to_string(), json!(course_id));
            group.insert("name".to_string(), json!(name));
            if let Some(description) = obj.get("description").and_then(Value::as_str) {
                group.insert("description".to_string(), json!(description));
            }
            groups.push(Value::Object(group));
        }

        let result = self
            .rpc("core_group_create_groups", json!({ "groups": groups }))
            .await?;
        Ok(format_response(&result, Some("Groups Created"), fmt))
    }

    async fn tool_create_forum_discussion(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let course_id = required_i64(args, "course_id")?;
        self.guard_course_write(course_id)?;
        let forum_id = required_i64(args, "forum_id")?;
        let subject = required_string(args, "subject")?;
        let message = required_string(args, "message")?;
        let pinned = arg_optional_bool(args, "pinned")?.unwrap_or(false);

        let result = self
            .rpc(
                "mod_forum_add_discussion",
                json!({
                    "forumid": forum_id,
                    "subject": subject,
                    "message": message,
                    "options": [{
                        "name": "discussionpinned",
                        "value": if pinned { "1" } else { "0" }
                    }]
                }),
            )
            .await?;
        let payload = json!({
            "discussion_id": result.get("discussionid").cloned().unwrap_or(Value::Null),
            "forum_id": forum_id,
            "course_id": course_id,
            "subject": subject
        });
        Ok(format_response(&payload, Some("Discussion Created"), fmt))
    }

    async fn tool_send_message(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let fmt = response_format(args)?;
        let recipient = required_i64(args, "recipient_user_id")?;
        let text = required_string(args, "message_text")?;

        let result = self
            .rpc(
                "core_message_send_instant_messages",
                json!({
                    "messages": [{
                        "touserid": recipient,
                        "text": text,
                        "textformat": TEXT_FORMAT_HTML
                    }]
                }),
            )
            .await?;
        let message_id = result.pointer("/0/msgid").cloned().unwrap_or(Value::Null);
        let payload = json!({
            "message_id": message_id,
            "recipient_user_id": recipient,
            "sent": true
        });
        Ok(format_response(&payload, Some("Message Sent"), fmt))
    }
}

// --------------------------------------------------------------------------
// JSON-RPC scaffolding
// --------------------------------------------------------------------------

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

/// Tool-level failure, rendered into the `isError` envelope of a
/// `tools/call` response.
#[derive(Debug, Clone)]
struct ToolError {
    code: String,
    message: String,
    field: Option<String>,
    docs_hint: Option<String>,
    details: Option<Value>,
}

impl ToolError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }

    fn render(&self) -> String {
        match &self.docs_hint {
            Some(hint) => format!("{}\n\n{hint}", self.message),
            None => self.message.clone(),
        }
    }
}

fn role_name(role_id: i64) -> String {
    match role_id {
        1 => "Manager".to_string(),
        3 => "Non-editing teacher".to_string(),
        4 => "Teacher".to_string(),
        5 => "Student".to_string(),
        other => format!("Role {other}"),
    }
}

// --------------------------------------------------------------------------
// Argument extraction
// --------------------------------------------------------------------------

fn response_format(args: &Map<String, Value>) -> Result<OutputFormat, ToolError> {
    match args.get("format") {
        None | Some(Value::Null) => Ok(OutputFormat::default()),
        Some(Value::String(raw)) => OutputFormat::parse(raw).ok_or_else(|| {
            ToolError::new(
                "validation_failed",
                format!("'format' must be 'markdown' or 'json', got '{raw}'"),
            )
            .with_field("format")
        }),
        Some(_) => Err(
            ToolError::new("validation_failed", "'format' must be a string").with_field("format"),
        ),
    }
}

fn required_i64(args: &Map<String, Value>, key: &str) -> Result<i64, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            "validation_failed",
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    value.as_i64().ok_or_else(|| {
        ToolError::new("validation_failed", format!("'{key}' must be an integer")).with_field(key)
    })
}

fn required_f64(args: &Map<String, Value>, key: &str) -> Result<f64, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            "validation_failed",
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    value.as_f64().ok_or_else(|| {
        ToolError::new("validation_failed", format!("'{key}' must be a number")).with_field(key)
    })
}

fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            "validation_failed",
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v.clone()),
        Value::String(_) => Err(ToolError::new(
            "validation_failed",
            format!("'{key}' must not be empty"),
        )
        .with_field(key)),
        _ => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn required_array(args: &Map<String, Value>, key: &str) -> Result<Vec<Value>, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            "validation_failed",
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    let items = value.as_array().ok_or_else(|| {
        ToolError::new("validation_failed", format!("'{key}' must be an array")).with_field(key)
    })?;
    if items.is_empty() {
        return Err(ToolError::new(
            "validation_failed",
            format!("'{key}' must not be empty"),
        )
        .with_field(key));
    }
    Ok(items.clone())
}

fn required_i64_array(args: &Map<String, Value>, key: &str) -> Result<Vec<i64>, ToolError> {
    required_array(args, key)?
        .iter()
        .map(|item| {
            item.as_i64().ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    format!("'{key}' items must be integers"),
                )
                .with_field(key)
            })
        })
        .collect()
}

fn arg_optional_i64(args: &Map<String, Value>, key: &str) -> Result<Option<i64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| {
                ToolError::new("validation_failed", format!("'{key}' must be an integer"))
                    .with_field(key)
            })
            .map(Some),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be an integer"))
                .with_field(key),
        ),
    }
}

fn arg_optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_bool(args: &Map<String, Value>, key: &str) -> Result<Option<bool>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(v)) => Ok(Some(*v)),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a boolean"))
                .with_field(key),
        ),
    }
}

// --------------------------------------------------------------------------
// Wire responses and framing
// --------------------------------------------------------------------------

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

async fn read_framed_json(
    reader: &mut BufReader<tokio::io::Stdin>,
) -> Result<Option<Value>, std::io::Error> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json(
    writer: &mut tokio::io::Stdout,
    value: &Value,
) -> Result<(), std::io::Error> {
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use moodle_core::config::{Environment, WritePolicy};

    fn dev_server() -> McpServer {
        server_with_policy(WritePolicy::new(Environment::Development, [7299], false))
    }

    fn prod_server() -> McpServer {
        server_with_policy(WritePolicy::new(Environment::Production, [], false))
    }

    fn server_with_policy(write_policy: WritePolicy) -> McpServer {
        let config = MoodleConfig {
            // A closed port: gate and validation checks must fire before
            // any request is attempted.
            base_url: "http://127.0.0.1:9".to_string(),
            token: "testtoken".to_string(),
            api_timeout_secs: 2,
            max_connections: 4,
            max_keepalive_connections: 2,
            max_response_chars: 50_000,
            write_policy,
        };
        let client = MoodleClient::new(&config).unwrap();
        McpServer::new(client, config)
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn initialize_payload_names_protocol_and_environment() {
        let payload = dev_server().initialize_payload();
        assert_eq!(payload["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(payload["serverInfo"]["name"], MCP_SERVER_NAME);
        let instructions = payload["instructions"].as_str().unwrap();
        assert!(instructions.contains("DEVELOPMENT"));
        assert!(instructions.contains("moodle_get_site_info"));

        let payload = prod_server().initialize_payload();
        assert!(payload["instructions"].as_str().unwrap().contains("PRODUCTION"));
    }

    #[test]
    fn tools_list_exposes_every_definition() {
        let payload = dev_server().tools_list_payload();
        let tools = payload["tools"].as_array().unwrap();
        assert_eq!(tools.len(), tool_definitions().len());
        let names: Vec<&str> = tools
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"moodle_get_site_info"));
        assert!(names.contains(&"moodle_get_course_groups"));
        assert!(names.contains(&"moodle_get_group_members"));
        assert!(names.contains(&"moodle_send_message"));
        for tool in tools {
            assert_eq!(tool["inputSchema"]["type"], "object");
        }
    }

    #[tokio::test]
    async fn every_listed_tool_is_dispatchable() {
        let server = dev_server();
        for tool in tool_definitions() {
            let result = server.execute_tool(tool.name, &Map::new()).await;
            if let Err(err) = result {
                assert_ne!(err.code, "unknown_tool", "{} is not dispatched", tool.name);
            }
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_an_is_error_envelope_not_a_protocol_error() {
        let server = dev_server();
        let response = server
            .handle_tools_call(json!({ "name": "moodle_nope", "arguments": {} }))
            .await
            .unwrap();
        assert_eq!(response["isError"], true);
        let text = response["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Unknown tool: moodle_nope"));
        assert_eq!(response["structuredContent"]["error"], "unknown_tool");
    }

    #[tokio::test]
    async fn dev_write_outside_allowlist_is_blocked_before_any_request() {
        let server = dev_server();
        let err = server
            .execute_tool("moodle_delete_course", &args(json!({ "course_id": 42 })))
            .await
            .unwrap_err();
        assert_eq!(err.code, "write_blocked");
        assert!(err.message.contains("Course 42"));
        assert!(err.message.contains("7299"));
    }

    #[tokio::test]
    async fn import_requires_both_courses_to_pass_the_gate() {
        let server = dev_server();
        let err = server
            .execute_tool(
                "moodle_import_course_content",
                &args(json!({ "source_course_id": 7299, "dest_course_id": 9999 })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "write_blocked");
        assert!(err.message.contains("Course 9999"));
    }

    #[tokio::test]
    async fn production_blocks_course_creation_by_default() {
        let server = prod_server();
        let err = server
            .execute_tool(
                "moodle_create_course",
                &args(json!({
                    "fullname": "X",
                    "shortname": "x",
                    "category_id": 1
                })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "write_blocked");
        assert!(err.message.contains("PRODUCTION"));
    }

    #[tokio::test]
    async fn allowed_write_proceeds_to_the_transport() {
        // Gate passes, then the call fails on the closed port: proves the
        // gate check happens before, and independently of, the transport.
        let server = dev_server();
        let err = server
            .execute_tool("moodle_delete_course", &args(json!({ "course_id": 7299 })))
            .await
            .unwrap_err();
        assert_eq!(err.code, "connection_error");
    }

    #[tokio::test]
    async fn send_message_is_not_course_gated() {
        let server = prod_server();
        let err = server
            .execute_tool(
                "moodle_send_message",
                &args(json!({ "recipient_user_id": 1, "message_text": "hi" })),
            )
            .await
            .unwrap_err();
        // Reaches the transport even with writes disabled in production.
        assert_eq!(err.code, "connection_error");
    }

    #[tokio::test]
    async fn missing_required_argument_is_a_validation_error() {
        let server = dev_server();
        let err = server
            .execute_tool("moodle_get_course_details", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("course_id"));
    }

    #[tokio::test]
    async fn invalid_format_argument_is_rejected() {
        let server = dev_server();
        let err = server
            .execute_tool(
                "moodle_get_course_details",
                &args(json!({ "course_id": 1, "format": "yaml" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("format"));
    }

    #[tokio::test]
    async fn calendar_window_survives_absurd_days_ahead() {
        // The window arithmetic must clamp rather than overflow; the call
        // then fails on the closed port like any other transport attempt.
        let server = dev_server();
        let err = server
            .execute_tool(
                "moodle_get_calendar_events",
                &args(json!({ "days_ahead": i64::MAX })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "connection_error");
    }

    #[tokio::test]
    async fn group_read_tools_validate_their_ids() {
        let server = dev_server();
        let err = server
            .execute_tool("moodle_get_course_groups", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("course_id"));

        let err = server
            .execute_tool("moodle_get_group_members", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("group_id"));
    }

    #[tokio::test]
    async fn update_course_with_no_changes_is_rejected() {
        let server = dev_server();
        let err = server
            .execute_tool("moodle_update_course", &args(json!({ "course_id": 7299 })))
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert!(err.message.contains("No updates specified"));
    }

    #[test]
    fn tool_error_mapping_attaches_remediation_hints() {
        let server = dev_server();

        let err = server.tool_error(MoodleError::Auth("bad token".to_string()));
        assert_eq!(err.code, "authentication_failed");
        assert!(err.docs_hint.unwrap().contains("web services are enabled"));

        let err = server.tool_error(MoodleError::WriteDenied("blocked".to_string()));
        assert_eq!(err.code, "write_blocked");
        assert!(err.docs_hint.unwrap().contains("MOODLE_DEV_COURSE_WHITELIST"));
    }

    #[test]
    fn api_debuginfo_is_development_only() {
        let api_error = || MoodleError::Api {
            code: "dmlwriteexception".to_string(),
            message: "db failure".to_string(),
            debug_info: Some("duplicate key".to_string()),
        };

        let err = dev_server().tool_error(api_error());
        assert_eq!(err.code, "moodle_api_error");
        assert_eq!(
            err.details.as_ref().unwrap()["debuginfo"],
            "duplicate key"
        );

        let err = prod_server().tool_error(api_error());
        assert!(err.details.as_ref().unwrap().get("debuginfo").is_none());
    }

    #[tokio::test]
    async fn jsonrpc_envelope_rules() {
        let server = dev_server();

        // Wrong protocol version.
        let response = server
            .handle_single_message(json!({ "jsonrpc": "1.0", "id": 1, "method": "ping" }))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32600);

        // Notifications produce no response.
        let response = server
            .handle_single_message(json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized"
            }))
            .await;
        assert!(response.is_none());

        // Unknown method.
        let response = server
            .handle_single_message(json!({ "jsonrpc": "2.0", "id": 2, "method": "nope" }))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);

        // Ping round-trips.
        let response = server
            .handle_single_message(json!({ "jsonrpc": "2.0", "id": 3, "method": "ping" }))
            .await
            .unwrap();
        assert_eq!(response["result"], json!({}));

        // Empty batch is rejected.
        let responses = server.handle_incoming_message(json!([])).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["code"], -32600);
    }

    #[test]
    fn argument_helpers_validate_types() {
        let map = args(json!({
            "course_id": 7,
            "name": "x",
            "flag": true,
            "wrong": "seven"
        }));
        assert_eq!(required_i64(&map, "course_id").unwrap(), 7);
        assert_eq!(required_string(&map, "name").unwrap(), "x");
        assert_eq!(arg_optional_bool(&map, "flag").unwrap(), Some(true));
        assert_eq!(arg_optional_i64(&map, "missing").unwrap(), None);
        assert!(required_i64(&map, "wrong").is_err());
        assert!(arg_optional_bool(&map, "name").is_err());
        assert!(required_i64_array(&args(json!({ "ids": [1, "x"] })), "ids").is_err());
        assert_eq!(
            required_i64_array(&args(json!({ "ids": [1, 2] })), "ids").unwrap(),
            vec![1, 2]
        );
    }
}
