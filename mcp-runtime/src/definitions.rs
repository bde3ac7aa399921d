//! Tool surface exposed over `tools/list`.

use serde_json::{Value, json};

#[derive(Debug)]
pub(crate) struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

fn format_property() -> Value {
    json!({ "type": "string", "enum": ["markdown", "json"], "default": "markdown" })
}

pub(crate) fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        // ------------------------------------------------------------------
        // Site and users
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_get_site_info",
            description: "Get Moodle site information and the authenticated user's identity. Call this first to confirm connectivity.",
            input_schema: json!({
                "type": "object",
                "properties": { "format": format_property() },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_available_functions",
            description: "List the web service functions the current token may call.",
            input_schema: json!({
                "type": "object",
                "properties": { "format": format_property() },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_user_profile",
            description: "Get a user's profile by id. REQUIRED: user_id (integer). Example: user_id=624.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "user_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["user_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_search_users",
            description: "Search users by full name. REQUIRED: query (string). Optional: limit (integer, default 20). Example: query='Smith'.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "default": 20, "minimum": 1 },
                    "format": format_property()
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        },
        // ------------------------------------------------------------------
        // Courses
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_list_user_courses",
            description: "List courses a user is enrolled in. Optional: user_id (integer, defaults to the authenticated user).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "user_id": { "type": "integer" },
                    "format": format_property()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_course_details",
            description: "Get full details for one course. REQUIRED: course_id (integer). Example: course_id=2292.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_search_courses",
            description: "Search the course catalogue. REQUIRED: query (string). Example: query='rust'.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "format": format_property()
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_course_contents",
            description: "Get the sections, activities and resources of a course. REQUIRED: course_id (integer).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_enrolled_users",
            description: "List users enrolled in a course. REQUIRED: course_id (integer).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_course_categories",
            description: "List all course categories.",
            input_schema: json!({
                "type": "object",
                "properties": { "format": format_property() },
                "additionalProperties": false
            }),
        },
        // ------------------------------------------------------------------
        // Assignments
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_list_assignments",
            description: "List assignments in a course. REQUIRED: course_id (integer).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_assignment_submissions",
            description: "List submissions for an assignment. REQUIRED: assignment_id (integer). Requires grading permissions.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "assignment_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["assignment_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_submission_status",
            description: "Get submission status for one user on an assignment. REQUIRED: assignment_id (integer). Optional: user_id (defaults to the authenticated user).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "assignment_id": { "type": "integer" },
                    "user_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["assignment_id"],
                "additionalProperties": false
            }),
        },
        // ------------------------------------------------------------------
        // Grades
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_get_user_grades",
            description: "Get a user's grade report for a course. REQUIRED: course_id (integer). Optional: user_id (defaults to the authenticated user).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "user_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_grade_items",
            description: "List gradable items (assignments, quizzes, ...) in a course. REQUIRED: course_id (integer).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_gradebook_overview",
            description: "Get grade totals across all enrolled courses. Optional: user_id (defaults to the authenticated user).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "user_id": { "type": "integer" },
                    "format": format_property()
                },
                "additionalProperties": false
            }),
        },
        // ------------------------------------------------------------------
        // Calendar
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_get_calendar_events",
            description: "Get upcoming calendar events. Optional: days_ahead (integer, default 30).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "days_ahead": { "type": "integer", "default": 30, "minimum": 1, "maximum": 3650 },
                    "format": format_property()
                },
                "additionalProperties": false
            }),
        },
        // ------------------------------------------------------------------
        // Quizzes
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_get_quizzes",
            description: "List quizzes in a course. REQUIRED: course_id (integer).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_quiz_attempts",
            description: "List a user's attempts for a quiz. REQUIRED: quiz_id (integer). Optional: user_id (defaults to the authenticated user).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "quiz_id": { "type": "integer" },
                    "user_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["quiz_id"],
                "additionalProperties": false
            }),
        },
        // ------------------------------------------------------------------
        // Forums
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_get_forum_discussions",
            description: "List recent discussions across the forums of a course. REQUIRED: course_id (integer). Optional: limit (per forum, default 10).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "limit": { "type": "integer", "default": 10, "minimum": 1 },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_discussion_posts",
            description: "Get all posts in a forum discussion. REQUIRED: discussion_id (integer).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "discussion_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["discussion_id"],
                "additionalProperties": false
            }),
        },
        // ------------------------------------------------------------------
        // Messaging
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_get_conversations",
            description: "List the authenticated user's message conversations. Optional: limit (default 20), offset (default 0).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "default": 20, "minimum": 1 },
                    "offset": { "type": "integer", "default": 0, "minimum": 0 },
                    "format": format_property()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_unread_count",
            description: "Count the authenticated user's unread message conversations.",
            input_schema: json!({
                "type": "object",
                "properties": { "format": format_property() },
                "additionalProperties": false
            }),
        },
        // ------------------------------------------------------------------
        // Groups
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_get_course_groups",
            description: "List all groups in a course with their ids, names and descriptions. REQUIRED: course_id (integer).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_group_members",
            description: "List the user ids of a group's members. REQUIRED: group_id (integer).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "group_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["group_id"],
                "additionalProperties": false
            }),
        },
        // ------------------------------------------------------------------
        // Badges and completion
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_get_user_badges",
            description: "List badges awarded to a user. Optional: user_id (defaults to the authenticated user), course_id (filter), search (string).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "user_id": { "type": "integer" },
                    "course_id": { "type": "integer" },
                    "search": { "type": "string" },
                    "format": format_property()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_activities_completion_status",
            description: "Get per-activity completion status in a course. REQUIRED: course_id (integer). Optional: user_id (defaults to the authenticated user).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "user_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_get_course_completion_status",
            description: "Get overall course completion status for a user. REQUIRED: course_id (integer). Optional: user_id (defaults to the authenticated user).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "user_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        // ------------------------------------------------------------------
        // Write operations. Every tool below is checked against the write
        // policy before any request is sent.
        // ------------------------------------------------------------------
        ToolDefinition {
            name: "moodle_create_course",
            description: "Create a new course. REQUIRED: fullname, shortname (strings), category_id (integer). Optional: summary, course_format (default 'topics'), visible (default true). WRITE OPERATION - blocked in production unless writes are enabled.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "fullname": { "type": "string" },
                    "shortname": { "type": "string" },
                    "category_id": { "type": "integer" },
                    "summary": { "type": "string" },
                    "course_format": { "type": "string", "default": "topics" },
                    "visible": { "type": "boolean", "default": true },
                    "format": format_property()
                },
                "required": ["fullname", "shortname", "category_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_update_course",
            description: "Update course settings. REQUIRED: course_id (integer). Optional: fullname, shortname, summary, visible. WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "fullname": { "type": "string" },
                    "shortname": { "type": "string" },
                    "summary": { "type": "string" },
                    "visible": { "type": "boolean" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_delete_course",
            description: "Permanently delete a course. REQUIRED: course_id (integer). WRITE OPERATION - only works on allow-listed courses. This cannot be undone.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_duplicate_course",
            description: "Duplicate a course with all activities. REQUIRED: course_id (source, integer), fullname, shortname (strings), category_id (integer). Optional: visible (default true). WRITE OPERATION - the source course must be allow-listed.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "fullname": { "type": "string" },
                    "shortname": { "type": "string" },
                    "category_id": { "type": "integer" },
                    "visible": { "type": "boolean", "default": true },
                    "format": format_property()
                },
                "required": ["course_id", "fullname", "shortname", "category_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_import_course_content",
            description: "Import activities from one course into another. REQUIRED: source_course_id, dest_course_id (integers). WRITE OPERATION - BOTH courses must be allow-listed.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "source_course_id": { "type": "integer" },
                    "dest_course_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["source_course_id", "dest_course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_enrol_users",
            description: "Manually enrol users into a course. REQUIRED: course_id (integer), user_ids (array of integers). Optional: role_id (default 5 = Student). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "user_ids": { "type": "array", "items": { "type": "integer" }, "minItems": 1 },
                    "role_id": { "type": "integer", "default": 5 },
                    "format": format_property()
                },
                "required": ["course_id", "user_ids"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_unenrol_users",
            description: "Remove users from a course. REQUIRED: course_id (integer), user_ids (array of integers). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "user_ids": { "type": "array", "items": { "type": "integer" }, "minItems": 1 },
                    "format": format_property()
                },
                "required": ["course_id", "user_ids"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_save_assignment_submission",
            description: "Save online-text assignment submission as a draft. REQUIRED: course_id, assignment_id (integers), submission_text (string, HTML allowed). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "assignment_id": { "type": "integer" },
                    "submission_text": { "type": "string" },
                    "format": format_property()
                },
                "required": ["course_id", "assignment_id", "submission_text"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_submit_assignment",
            description: "Submit the saved draft of an assignment for grading. REQUIRED: course_id, assignment_id (integers). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "assignment_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id", "assignment_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_save_assignment_grade",
            description: "Grade an assignment submission. REQUIRED: course_id, assignment_id, user_id (integers), grade (number). Optional: feedback_text (string). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "assignment_id": { "type": "integer" },
                    "user_id": { "type": "integer" },
                    "grade": { "type": "number" },
                    "feedback_text": { "type": "string" },
                    "format": format_property()
                },
                "required": ["course_id", "assignment_id", "user_id", "grade"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_update_grades",
            description: "Batch-update grades for one grade item. REQUIRED: course_id (integer), item_name (string), grades (array of {userid, grade}). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "item_name": { "type": "string" },
                    "grades": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "userid": { "type": "integer" },
                                "grade": { "type": "number" }
                            },
                            "required": ["userid", "grade"],
                            "additionalProperties": false
                        }
                    },
                    "format": format_property()
                },
                "required": ["course_id", "item_name", "grades"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_create_calendar_event",
            description: "Create a course calendar event. REQUIRED: course_id (integer), name (string), time_start (unix seconds). Optional: duration (seconds, default 0), description (string). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "name": { "type": "string" },
                    "time_start": { "type": "integer" },
                    "duration": { "type": "integer", "default": 0, "minimum": 0 },
                    "description": { "type": "string" },
                    "format": format_property()
                },
                "required": ["course_id", "name", "time_start"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_delete_calendar_event",
            description: "Delete a calendar event. REQUIRED: course_id, event_id (integers). Optional: delete_repeats (boolean, also delete repeated instances). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "event_id": { "type": "integer" },
                    "delete_repeats": { "type": "boolean", "default": false },
                    "format": format_property()
                },
                "required": ["course_id", "event_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_mark_course_self_completed",
            description: "Mark a course as self-completed for the authenticated user. REQUIRED: course_id (integer). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "format": format_property()
                },
                "required": ["course_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_create_groups",
            description: "Create groups in a course. REQUIRED: course_id (integer), groups (array of {name, description?}). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "groups": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "description": { "type": "string" }
                            },
                            "required": ["name"],
                            "additionalProperties": false
                        }
                    },
                    "format": format_property()
                },
                "required": ["course_id", "groups"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_create_forum_discussion",
            description: "Start a new discussion in a forum. REQUIRED: course_id, forum_id (integers), subject, message (strings). Optional: pinned (boolean). WRITE OPERATION - only works on allow-listed courses.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "course_id": { "type": "integer" },
                    "forum_id": { "type": "integer" },
                    "subject": { "type": "string" },
                    "message": { "type": "string" },
                    "pinned": { "type": "boolean", "default": false },
                    "format": format_property()
                },
                "required": ["course_id", "forum_id", "subject", "message"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "moodle_send_message",
            description: "Send an instant message to another user. REQUIRED: recipient_user_id (integer), message_text (string). Not course-scoped; sends immediately.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "recipient_user_id": { "type": "integer" },
                    "message_text": { "type": "string" },
                    "format": format_property()
                },
                "required": ["recipient_user_id", "message_text"],
                "additionalProperties": false
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tool_names_are_unique_and_prefixed() {
        let tools = tool_definitions();
        let names: HashSet<&str> = tools.iter().map(|t| t.name).collect();
        assert_eq!(names.len(), tools.len());
        for tool in &tools {
            assert!(tool.name.starts_with("moodle_"), "bad name {}", tool.name);
        }
    }

    #[test]
    fn every_schema_is_a_closed_object_with_format() {
        for tool in tool_definitions() {
            let schema = &tool.input_schema;
            assert_eq!(schema["type"], "object", "{}", tool.name);
            assert_eq!(schema["additionalProperties"], false, "{}", tool.name);
            assert!(
                schema["properties"]["format"].is_object(),
                "{} lacks the format property",
                tool.name
            );
        }
    }

    #[test]
    fn write_tools_require_a_target() {
        // Every course-gated write tool must declare course_id (or both
        // import endpoints) as required so the gate always has a target.
        let exempt = ["moodle_create_course", "moodle_send_message"];
        for tool in tool_definitions() {
            if !tool.description.contains("WRITE OPERATION") || exempt.contains(&tool.name) {
                continue;
            }
            let required = tool.input_schema["required"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let has_target = required.iter().any(|r| {
                matches!(
                    r.as_str(),
                    Some("course_id") | Some("source_course_id") | Some("dest_course_id")
                )
            });
            assert!(has_target, "{} lacks a gate target", tool.name);
        }
    }
}
