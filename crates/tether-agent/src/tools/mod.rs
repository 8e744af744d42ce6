mod definitions;

use crate::ToolError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use definitions::tool_definitions;

pub const LIST_FILES_TOOL: &str = "list_files";
pub const READ_FILE_TOOL: &str = "read_file";
pub const WRITE_FILE_TOOL: &str = "write_file";
pub const CREATE_FILE_TOOL: &str = "create_file";
pub const DELETE_FILE_TOOL: &str = "delete_file";
pub const RENAME_FILE_TOOL: &str = "rename_file";
pub const SEARCH_FILES_TOOL: &str = "search_files";
pub const RUN_CMD_TOOL: &str = "run_cmd";

pub const TOOL_NAMES: &[&str] = &[
    LIST_FILES_TOOL,
    READ_FILE_TOOL,
    WRITE_FILE_TOOL,
    CREATE_FILE_TOOL,
    DELETE_FILE_TOOL,
    RENAME_FILE_TOOL,
    SEARCH_FILES_TOOL,
    RUN_CMD_TOOL,
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListFilesArgs {
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadFileArgs {
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteFileArgs {
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameFileArgs {
    pub old_path: String,
    pub new_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchFilesArgs {
    pub query: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunCmdArgs {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// A tool call with its arguments decoded into the record for that tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ToolRequest {
    ListFiles(ListFilesArgs),
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    CreateFile(WriteFileArgs),
    DeleteFile(DeleteFileArgs),
    RenameFile(RenameFileArgs),
    SearchFiles(SearchFilesArgs),
    RunCmd(RunCmdArgs),
}

impl ToolRequest {
    pub fn parse(name: &str, arguments: &Value) -> Result<Self, ToolError> {
        if !TOOL_NAMES.contains(&name) {
            return Err(ToolError::UnknownTool(name.to_string()));
        }
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments.clone()
        };
        if !arguments.is_object() {
            return Err(ToolError::Validation(format!(
                "arguments for '{name}' must be a JSON object"
            )));
        }
        serde_json::from_value(json!({ "tool": name, "args": arguments }))
            .map_err(|error| ToolError::Validation(format!("{name}: {error}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ListFiles(_) => LIST_FILES_TOOL,
            Self::ReadFile(_) => READ_FILE_TOOL,
            Self::WriteFile(_) => WRITE_FILE_TOOL,
            Self::CreateFile(_) => CREATE_FILE_TOOL,
            Self::DeleteFile(_) => DELETE_FILE_TOOL,
            Self::RenameFile(_) => RENAME_FILE_TOOL,
            Self::SearchFiles(_) => SEARCH_FILES_TOOL,
            Self::RunCmd(_) => RUN_CMD_TOOL,
        }
    }

    /// Every path-shaped argument, including a command's working directory.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Self::ListFiles(args) => vec![args.path.as_str()],
            Self::ReadFile(args) => vec![args.path.as_str()],
            Self::WriteFile(args) | Self::CreateFile(args) => vec![args.path.as_str()],
            Self::DeleteFile(args) => vec![args.path.as_str()],
            Self::RenameFile(args) => vec![args.old_path.as_str(), args.new_path.as_str()],
            Self::SearchFiles(args) => args.path.as_deref().into_iter().collect(),
            Self::RunCmd(args) => args.cwd.as_deref().into_iter().collect(),
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Self::RunCmd(args) => Some(args.command.as_str()),
            _ => None,
        }
    }

    /// Arguments as JSON, with file contents replaced by their size so the
    /// value stays small enough for events and permission prompts.
    pub fn summary_arguments(&self) -> Value {
        match self {
            Self::WriteFile(args) | Self::CreateFile(args) => json!({
                "path": args.path,
                "bytes": args.content.len(),
            }),
            other => serde_json::to_value(other)
                .ok()
                .and_then(|value| value.get("args").cloned())
                .unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_calls_into_typed_requests() {
        let request = ToolRequest::parse(
            RUN_CMD_TOOL,
            &json!({ "command": "npm test", "cwd": "/srv/app" }),
        )
        .unwrap();
        assert_eq!(
            request,
            ToolRequest::RunCmd(RunCmdArgs {
                command: "npm test".to_string(),
                cwd: Some("/srv/app".to_string()),
            })
        );
        assert_eq!(request.name(), RUN_CMD_TOOL);
        assert_eq!(request.paths(), vec!["/srv/app"]);
        assert_eq!(request.command(), Some("npm test"));

        let rename = ToolRequest::parse(
            RENAME_FILE_TOOL,
            &json!({ "old_path": "/w/a", "new_path": "/w/b" }),
        )
        .unwrap();
        assert_eq!(rename.paths(), vec!["/w/a", "/w/b"]);
    }

    #[test]
    fn rejects_unknown_tools_and_bad_arguments() {
        assert_eq!(
            ToolRequest::parse("format_disk", &json!({})),
            Err(ToolError::UnknownTool("format_disk".to_string()))
        );
        assert!(matches!(
            ToolRequest::parse(WRITE_FILE_TOOL, &json!({ "path": "/w/a" })),
            Err(ToolError::Validation(_))
        ));
        assert!(matches!(
            ToolRequest::parse(READ_FILE_TOOL, &json!({ "path": "/w/a", "extra": 1 })),
            Err(ToolError::Validation(_))
        ));
        assert!(matches!(
            ToolRequest::parse(READ_FILE_TOOL, &json!("path")),
            Err(ToolError::Validation(_))
        ));
    }

    #[test]
    fn summary_arguments_hide_file_contents() {
        let request = ToolRequest::WriteFile(WriteFileArgs {
            path: "/w/a".to_string(),
            content: "secret body".to_string(),
        });
        assert_eq!(request.summary_arguments(), json!({ "path": "/w/a", "bytes": 11 }));

        let search = ToolRequest::SearchFiles(SearchFilesArgs {
            query: "todo".to_string(),
            path: None,
        });
        assert_eq!(search.summary_arguments()["query"], "todo");
    }

    #[test]
    fn every_tool_has_a_definition() {
        let definitions = tool_definitions();
        let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, TOOL_NAMES);
    }
}
