use crate::{AgentOptions, ContextInfo};

pub const PLAN_FALLBACK: &str = "No plan could be generated for this request.";

const AGENT_BASE_PROMPT: &str = "You are a software engineering agent operating on a remote machine through a small set of tools. \
Work inside the workspace root unless told otherwise. Read files before changing them, and prefer small, targeted edits. \
Always use absolute paths. Every file change you make is snapshotted and can be rolled back by the user. \
Some tool calls may be held for human approval; if a call is denied, do not retry it unchanged. \
When the task is complete, reply with a short summary of what you changed and do not call any more tools.";

const PLAN_PROMPT: &str = "You are a software engineering planner. You cannot run tools. \
Given a task and its context, reply with a concise numbered plan of the steps an agent should take, \
naming the files likely involved and the commands needed to verify the result. Do not write the code.";

pub fn agent_system_prompt(options: &AgentOptions, context: &ContextInfo) -> String {
    let mut prompt = String::from(AGENT_BASE_PROMPT);
    prompt.push_str(&format!("\n\nWorkspace root: {}", context.workspace_root));

    if options.auto_run_commands {
        prompt.push_str("\nYou may run build, test and version-control commands with run_cmd.");
    } else {
        prompt.push_str(
            "\nEvery command needs human approval, so only run commands that are necessary.",
        );
    }
    if options.auto_fix_failures {
        prompt.push_str(
            "\nIf a build or test command fails, diagnose the failure and fix it before finishing.",
        );
    } else {
        prompt.push_str(
            "\nIf a build or test command fails, report the failure in your summary instead of attempting fixes.",
        );
    }
    if options.auto_install_deps {
        prompt.push_str("\nYou may install missing dependencies with the project's package manager.");
    } else {
        prompt.push_str(
            "\nDo not install dependencies without approval; mention any that are missing.",
        );
    }
    prompt
}

pub fn plan_system_prompt() -> &'static str {
    PLAN_PROMPT
}

/// User turn content: the prompt followed by the (already redacted) context.
pub fn render_user_turn(prompt: &str, context: &ContextInfo) -> String {
    let mut lines = vec![prompt.trim().to_string(), String::new(), "<context>".to_string()];
    lines.push(format!("workspace_root: {}", context.workspace_root));
    if let Some(file) = &context.current_file {
        lines.push(format!("current_file: {file}"));
    }
    if let Some(folder) = &context.folder_path {
        lines.push(format!("folder: {folder}"));
    }
    if context.whole_repo {
        lines.push("scope: whole repository".to_string());
    }
    if let Some(selection) = &context.selection {
        lines.push("selection:".to_string());
        lines.push("```".to_string());
        lines.push(selection.clone());
        lines.push("```".to_string());
    }
    lines.push("</context>".to_string());
    lines.join("\n")
}
