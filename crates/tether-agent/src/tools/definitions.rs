use serde_json::json;
use tether_llm::ToolDefinition;

use super::{
    CREATE_FILE_TOOL, DELETE_FILE_TOOL, LIST_FILES_TOOL, READ_FILE_TOOL, RENAME_FILE_TOOL,
    RUN_CMD_TOOL, SEARCH_FILES_TOOL, WRITE_FILE_TOOL,
};

fn path_only(name: &str, description: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters: json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": { "type": "string", "description": "Absolute path on the remote machine." }
            },
            "additionalProperties": false
        }),
    }
}

fn path_and_content(name: &str, description: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters: json!({
            "type": "object",
            "required": ["path", "content"],
            "properties": {
                "path": { "type": "string", "description": "Absolute path on the remote machine." },
                "content": { "type": "string", "description": "Complete new file content." }
            },
            "additionalProperties": false
        }),
    }
}

/// Schemas offered to the model, in a stable order.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        path_only(
            LIST_FILES_TOOL,
            "List a directory. Hidden entries are omitted; directories come first.",
        ),
        path_only(READ_FILE_TOOL, "Read a text file (up to 1 MiB)."),
        path_and_content(
            WRITE_FILE_TOOL,
            "Replace the full content of a file, creating it if needed. Existing content is snapshotted so it can be rolled back.",
        ),
        path_and_content(
            CREATE_FILE_TOOL,
            "Create a new file. Fails if the path already exists. Parent directories are created.",
        ),
        path_only(DELETE_FILE_TOOL, "Delete a file. Its content is snapshotted first."),
        ToolDefinition {
            name: RENAME_FILE_TOOL.to_string(),
            description: "Rename or move a file.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["old_path", "new_path"],
                "properties": {
                    "old_path": { "type": "string" },
                    "new_path": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: SEARCH_FILES_TOOL.to_string(),
            description: "Find files containing a literal text query. Returns at most 50 paths."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["query"],
                "properties": {
                    "query": { "type": "string", "description": "Literal text; shell metacharacters are rejected." },
                    "path": { "type": "string", "description": "Directory to search. Defaults to the workspace root." }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: RUN_CMD_TOOL.to_string(),
            description: "Run a shell command on the remote machine (120 s timeout). Output is truncated."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["command"],
                "properties": {
                    "command": { "type": "string" },
                    "cwd": { "type": "string", "description": "Absolute working directory. Defaults to the workspace root." }
                },
                "additionalProperties": false
            }),
        },
    ]
}
