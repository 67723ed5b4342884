use serde_json::{json, Value};

/// Tool definitions advertised to the model. Names and argument shapes
/// mirror what the core tool router dispatches.
pub fn tool_specs() -> Vec<Value> {
    vec![
        json!({
            "name": "read_file",
            "description": "Read a file from the workspace. Returns the requested line range with line numbers metadata.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Workspace-relative path"},
                    "entire": {"type": "boolean", "description": "Read the whole file"},
                    "start": {"type": "integer", "description": "1-based start line"},
                    "end": {"type": "integer", "description": "1-based end line (inclusive)"}
                },
                "required": ["path"]
            }
        }),
        json!({
            "name": "write_file",
            "description": "Create or overwrite a file with the given content.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                    "instructions": {"type": "string", "description": "One-line summary of the change"}
                },
                "required": ["path", "content"]
            }
        }),
        json!({
            "name": "search_replace",
            "description": "Replace one unique occurrence of old_string in a file with new_string. Fails if the string is missing or ambiguous.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_string": {"type": "string"},
                    "new_string": {"type": "string"}
                },
                "required": ["path", "old_string", "new_string"]
            }
        }),
        json!({
            "name": "delete_file",
            "description": "Delete a file. Deleting a missing file succeeds.",
            "input_schema": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }
        }),
        json!({
            "name": "list_directory",
            "description": "List a directory. Set recursive for a flat listing of the whole subtree.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "default": "."},
                    "recursive": {"type": "boolean"}
                }
            }
        }),
        json!({
            "name": "search_files",
            "description": "Fuzzy filename search over the workspace.",
            "input_schema": {
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }
        }),
        json!({
            "name": "grep_search",
            "description": "Regex search over file contents. Returns at most 50 matching lines.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Extended regex"},
                    "include": {"type": "string", "description": "Filename glob to include"},
                    "exclude": {"type": "string", "description": "Filename glob to exclude"},
                    "case_sensitive": {"type": "boolean", "default": true}
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "codebase_search",
            "description": "Semantic-ish search: returns up to 5 code snippets ranked by relevance to the query.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "dirs": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "execute_command",
            "description": "Run a shell command in the workspace root. Foreground commands return stdout/stderr/exit code.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout": {"type": "integer", "description": "Seconds, default 30"},
                    "background": {"type": "boolean"},
                    "network_allowed": {"type": "boolean"}
                },
                "required": ["command"]
            }
        }),
        json!({
            "name": "todo_write",
            "description": "Replace (or merge into) the task todo list.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "todos": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "content": {"type": "string"},
                                "status": {"type": "string", "enum": ["PENDING", "IN_PROGRESS", "COMPLETED", "CANCELLED"]},
                                "sequence": {"type": "integer"}
                            },
                            "required": ["content"]
                        }
                    },
                    "merge": {"type": "boolean"}
                },
                "required": ["todos"]
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_cover_the_router_tool_set() {
        let specs = tool_specs();
        let names: Vec<&str> = specs
            .iter()
            .map(|s| s["name"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(names, shadow_core::tools::TOOL_NAMES);
    }

    #[test]
    fn every_spec_has_an_object_schema() {
        for spec in tool_specs() {
            assert_eq!(spec["input_schema"]["type"], "object", "{spec}");
        }
    }
}
