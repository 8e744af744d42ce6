//! Path and command policy.
//!
//! Everything here is pure: no I/O, no session state. The sandbox calls these
//! before touching the remote machine and the orchestrator calls
//! [`check_tool_permission`] before deciding whether to ask a human.

use crate::{CommandViolation, PathViolation, ToolRequest};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const MAX_COMMAND_LENGTH: usize = 4_096;

/// Base executables that may run without elevation.
pub const ALLOWED_EXECUTABLES: &[&str] = &[
    // version control
    "git",
    // javascript / typescript
    "npm", "npx", "yarn", "pnpm", "node", "bun", "deno", "tsc", "eslint", "prettier", "jest",
    "vitest", "mocha",
    // python
    "python", "python3", "pip", "pip3", "pytest", "poetry", "uv", "ruff", "black", "mypy",
    // rust / go / jvm / dotnet / ruby / php
    "cargo", "rustc", "rustfmt", "go", "gofmt", "mvn", "gradle", "dotnet", "ruby", "bundle",
    "rake", "rspec", "php", "composer",
    // build
    "make", "cmake",
    // read-only inspection
    "ls", "cat", "head", "tail", "grep", "rg", "find", "wc", "echo", "pwd", "which", "diff",
    "sort", "uniq", "tree", "stat", "file", "du", "date", "true", "false", "test", "cd",
];

struct DenyRule {
    pattern: Regex,
    reason: &'static str,
}

fn deny_rules() -> &'static [DenyRule] {
    static RULES: OnceLock<Vec<DenyRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        const SOURCES: &[(&str, &str)] = &[
            (
                r"\brm\s+(?:-\S+\s+)+(?:/\*?|~/?|\$HOME/?|\*)(?:\s|$|[;&|])",
                "recursive or forced delete of a filesystem root",
            ),
            (r"--no-preserve-root", "recursive or forced delete of a filesystem root"),
            (
                r"\bdd\b[^;&|]*\bof=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk)",
                "raw write to a disk device",
            ),
            (
                r">\s*/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk)",
                "raw write to a disk device",
            ),
            (r"\b(?:mkfs(?:\.\w+)?|mke2fs|wipefs)\b", "filesystem formatting"),
            (
                r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
                "fork bomb",
            ),
            (r"(?:^|[;&|(`]\s*|\$\(\s*)eval(?:\s|$)", "raw eval"),
            (
                r"\b(?:curl|wget)\b[^|;&]*\|\s*(?:sudo\s+)?(?:ba|z|da|k|fi)?sh\b",
                "piping a remote download into a shell",
            ),
            (
                r"\b(?:ba|z|da|k)?sh\s+<\(\s*(?:curl|wget)\b",
                "piping a remote download into a shell",
            ),
            (
                r"\b(?:chmod|chown|chgrp)\s+(?:-\S+\s+)*(?:\S+\s+)?/(?:etc|usr|bin|sbin|lib|lib64|var|boot|root|home)?/?(?:\s|$|[;&|])",
                "mass permission or ownership change on a root path",
            ),
            (
                r"(?:^|[;&|(]\s*|\bsudo\s+)(?:shutdown|reboot|halt|poweroff)\b",
                "power-state command",
            ),
            (r"\binit\s+[06]\b", "power-state command"),
            (
                r"\bsystemctl\s+(?:poweroff|reboot|halt|suspend|hibernate)\b",
                "power-state command",
            ),
        ];
        SOURCES
            .iter()
            .filter_map(|(source, reason)| match Regex::new(source) {
                Ok(pattern) => Some(DenyRule { pattern, reason }),
                Err(error) => {
                    tracing::error!(%source, %error, "invalid deny pattern");
                    None
                }
            })
            .collect()
    })
}

/// Normalizes an absolute POSIX path: collapses repeated slashes and drops
/// `.` segments and trailing slashes.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

pub fn validate_path(path: &str, workspace_root: &str, elevated: bool) -> Result<(), PathViolation> {
    if path.is_empty() {
        return Err(PathViolation::Empty);
    }
    if path.contains('\0') {
        return Err(PathViolation::NullByte);
    }
    if !path.starts_with('/') {
        return Err(PathViolation::NotAbsolute(path.to_string()));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(PathViolation::Traversal(path.to_string()));
    }
    if elevated {
        return Ok(());
    }

    let normalized = normalize_path(path);
    let root = normalize_path(workspace_root);
    let contained = root == "/"
        || normalized == root
        || normalized
            .strip_prefix(root.as_str())
            .is_some_and(|rest| rest.starts_with('/'));
    if contained {
        Ok(())
    } else {
        Err(PathViolation::NeedsElevation {
            path: normalized,
            workspace_root: root,
        })
    }
}

pub fn validate_command(command: &str, elevated: bool) -> Result<(), CommandViolation> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(CommandViolation::Empty);
    }
    if command.len() > MAX_COMMAND_LENGTH {
        return Err(CommandViolation::TooLong {
            limit: MAX_COMMAND_LENGTH,
        });
    }
    if let Some(rule) = deny_rules()
        .iter()
        .find(|rule| rule.pattern.is_match(trimmed))
    {
        return Err(CommandViolation::HardDenied {
            reason: rule.reason,
        });
    }
    if elevated {
        return Ok(());
    }

    if has_command_substitution(trimmed) {
        return Err(CommandViolation::NeedsElevation {
            executable: "command substitution".to_string(),
        });
    }
    for words in command_segments(trimmed)? {
        let Some(executable) = base_executable(&words) else {
            continue;
        };
        if !ALLOWED_EXECUTABLES.contains(&executable.as_str()) {
            return Err(CommandViolation::NeedsElevation { executable });
        }
    }
    Ok(())
}

/// Whether any segment of the command installs packages.
pub fn is_dependency_install(command: &str) -> bool {
    let Ok(segments) = command_segments(command.trim()) else {
        return false;
    };
    segments.iter().any(|words| {
        let Some(executable) = base_executable(words) else {
            return false;
        };
        let args: Vec<&str> = words
            .iter()
            .skip_while(|word| is_assignment(word))
            .skip(1)
            .map(String::as_str)
            .collect();
        let subcommand = args.iter().find(|arg| !arg.starts_with('-')).copied();
        match executable.as_str() {
            "npm" => matches!(subcommand, Some("install" | "i" | "ci" | "add")),
            "yarn" => matches!(subcommand, None | Some("add" | "install")),
            "pnpm" | "bun" => matches!(subcommand, Some("add" | "install" | "i")),
            "pip" | "pip3" | "bundle" => matches!(subcommand, Some("install")),
            "cargo" => matches!(subcommand, Some("add" | "install")),
            "go" => matches!(subcommand, Some("get" | "install")),
            "composer" => matches!(subcommand, Some("install" | "require")),
            "poetry" => matches!(subcommand, Some("add" | "install")),
            "uv" => matches!(subcommand, Some("add" | "pip")),
            "python" | "python3" => {
                args.windows(3)
                    .any(|window| window == ["-m", "pip", "install"])
            }
            _ => false,
        }
    })
}

fn has_command_substitution(command: &str) -> bool {
    let mut in_single = false;
    let mut escaped = false;
    let mut previous = '\0';
    for ch in command.chars() {
        if escaped {
            escaped = false;
            previous = ch;
            continue;
        }
        match ch {
            '\\' if !in_single => escaped = true,
            '\'' => in_single = !in_single,
            '`' if !in_single => return true,
            '(' if !in_single && previous == '$' => return true,
            _ => {}
        }
        previous = ch;
    }
    false
}

/// Splits on unquoted `;`, `&`, `|` and newlines, then shell-splits each
/// segment into words. `2>&1` style redirections are not separators.
fn command_segments(command: &str) -> Result<Vec<Vec<String>>, CommandViolation> {
    let chars: Vec<char> = command.chars().collect();
    let mut raw_segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for (index, &ch) in chars.iter().enumerate() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if !in_single => {
                current.push(ch);
                escaped = true;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            '&' if !in_single && !in_double => {
                let previous = index.checked_sub(1).map(|i| chars[i]);
                let next = chars.get(index + 1).copied();
                if matches!(previous, Some('>') | Some('<')) || next == Some('>') {
                    current.push(ch);
                } else {
                    raw_segments.push(std::mem::take(&mut current));
                }
            }
            ';' | '|' | '\n' if !in_single && !in_double => {
                raw_segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    raw_segments.push(current);

    raw_segments
        .into_iter()
        .filter(|segment| !segment.trim().is_empty())
        .map(|segment| {
            shell_words::split(&segment)
                .map_err(|error| CommandViolation::Unparseable(error.to_string()))
        })
        .collect()
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
                && !name.starts_with(|ch: char| ch.is_ascii_digit())
        }
        None => false,
    }
}

/// First word after leading `VAR=value` assignments, reduced to its file name.
fn base_executable(words: &[String]) -> Option<String> {
    let word = words.iter().find(|word| !is_assignment(word))?;
    let name = word.rsplit('/').next().unwrap_or(word);
    Some(name.to_string())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    pub auto_run_commands: bool,
    pub auto_install_deps: bool,
    /// The session already runs elevated, so containment and allow-list
    /// misses need no approval.
    #[serde(default)]
    pub allow_system_access: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub requires_permission: bool,
    pub reason: Option<String>,
}

impl PermissionCheck {
    pub fn allowed() -> Self {
        Self::default()
    }

    pub fn required(reason: impl Into<String>) -> Self {
        Self {
            requires_permission: true,
            reason: Some(reason.into()),
        }
    }
}

/// Decides whether a tool call needs a human decision before it runs.
///
/// Calls that would be rejected even when elevated never require permission;
/// they fail as ordinary tool errors.
pub fn check_tool_permission(
    tool: &ToolRequest,
    workspace_root: &str,
    policy: &PermissionPolicy,
) -> PermissionCheck {
    if let Some(command) = tool.command() {
        if validate_command(command, true).is_err() {
            return PermissionCheck::allowed();
        }
        if !policy.auto_run_commands {
            return PermissionCheck::required(format!(
                "Automatic command execution is disabled; approve running `{command}`"
            ));
        }
        if !policy.allow_system_access {
            if let Err(violation) = validate_command(command, false) {
                if violation.needs_elevation() {
                    return PermissionCheck::required(format!(
                        "System access required: {violation}"
                    ));
                }
                return PermissionCheck::allowed();
            }
        }
        if !policy.auto_install_deps && is_dependency_install(command) {
            return PermissionCheck::required(format!(
                "Dependency installation requires approval: `{command}`"
            ));
        }
    }

    if policy.allow_system_access {
        return PermissionCheck::allowed();
    }
    for path in tool.paths() {
        if let Err(violation) = validate_path(path, workspace_root, false) {
            if violation.needs_elevation() {
                return PermissionCheck::required(format!("System access required: {violation}"));
            }
        }
    }

    PermissionCheck::allowed()
}
