use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tether_agent::{
    AgentEvent, AgentOptions, AgentState, ContextInfo, EventKind, InMemorySnapshotStore,
    LocalRemoteChannel, NoopEventEmitter, Orchestrator, RemoteRegistry, RuntimeConfig,
    StartSession, event_channel,
};
use tether_llm::{AnthropicAdapter, Client, TracingMiddleware};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

const LOCAL_REMOTE: &str = "local";

#[derive(Parser, Debug)]
#[command(name = "tether-cli")]
#[command(about = "Run a Tether agent session against the local machine")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Plan(PlanArgs),
}

#[derive(clap::Args, Debug)]
struct ContextArgs {
    #[arg(long)]
    workspace: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    current_file: Option<String>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, action = ArgAction::SetTrue)]
    auto_run_commands: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    auto_fix_failures: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    auto_install_deps: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    pro: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    system_access: bool,
    #[arg(long, value_enum, default_value_t = PermissionMode::Auto)]
    permissions: PermissionMode,
    /// Undo every file change when the session does not finish successfully.
    #[arg(long, action = ArgAction::SetTrue)]
    rollback_on_failure: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct PlanArgs {
    #[command(flatten)]
    context: ContextArgs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PermissionMode {
    /// Console prompt on a terminal, deny otherwise.
    Auto,
    Console,
    Approve,
    Deny,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Plan(args) => plan_command(args).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_orchestrator(model: Option<&str>) -> Result<Orchestrator, String> {
    let mut config = RuntimeConfig::from_env().map_err(|error| error.to_string())?;
    if let Some(model) = model {
        config.model = model.to_string();
    }
    config.validate().map_err(|error| error.to_string())?;

    let adapter = AnthropicAdapter::from_env().map_err(|error| error.to_string())?;
    let mut client = Client::with_provider(Arc::new(adapter));
    client.add_middleware(Arc::new(TracingMiddleware));

    let remotes = Arc::new(
        RemoteRegistry::default().with_channel(LOCAL_REMOTE, Arc::new(LocalRemoteChannel::new())),
    );
    let snapshots = Arc::new(InMemorySnapshotStore::new(remotes.clone()));
    Ok(Orchestrator::new(Arc::new(client), remotes, snapshots, config))
}

fn context_info(args: &ContextArgs) -> Result<ContextInfo, String> {
    let workspace = std::fs::canonicalize(&args.workspace).map_err(|error| {
        format!("workspace '{}' is not accessible: {error}", args.workspace.display())
    })?;
    let mut context = ContextInfo::new(workspace.to_string_lossy());
    context.current_file = args.current_file.clone();
    Ok(context)
}

async fn plan_command(args: PlanArgs) -> Result<ExitCode, String> {
    let context = context_info(&args.context)?;
    let orchestrator = build_orchestrator(args.context.model.as_deref())?;
    let plan = orchestrator
        .plan_only(&args.context.prompt, &context, &NoopEventEmitter)
        .await
        .map_err(|error| error.to_string())?;
    println!("{plan}");
    Ok(ExitCode::SUCCESS)
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let context = context_info(&args.context)?;
    let orchestrator = build_orchestrator(args.context.model.as_deref())?;
    let options = AgentOptions {
        auto_run_commands: args.auto_run_commands,
        auto_fix_failures: args.auto_fix_failures,
        auto_install_deps: args.auto_install_deps,
        is_pro: args.pro,
        allow_system_access: args.system_access,
    };
    let permissions = match args.permissions {
        PermissionMode::Auto if is_interactive_terminal() => PermissionMode::Console,
        PermissionMode::Auto => PermissionMode::Deny,
        other => other,
    };

    let (emitter, mut events) = event_channel();
    let task = orchestrator
        .start_session(
            StartSession {
                remote_ref: LOCAL_REMOTE.to_string(),
                prompt: args.context.prompt.clone(),
                context,
                options,
            },
            Arc::new(emitter),
        )
        .await
        .map_err(|error| error.to_string())?;
    let session_id = task.session_id().to_string();

    let finished = task.join();
    tokio::pin!(finished);
    let final_state = loop {
        tokio::select! {
            state = &mut finished => break state,
            Some(event) = events.recv() => {
                print_event(&event, args.event_json);
                if event.kind == EventKind::PermissionRequired {
                    decide_permission(&orchestrator, &session_id, &event, permissions).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("stopping session {session_id}");
                orchestrator.stop(&session_id).await.map_err(|error| error.to_string())?;
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event, args.event_json);
    }
    tracing::info!(%session_id, state = %final_state, "session finished");

    if final_state != AgentState::Done && args.rollback_on_failure {
        let restored = orchestrator
            .rollback_session(&session_id)
            .await
            .map_err(|error| error.to_string())?;
        println!("rolled back {} file(s)", restored.len());
    }

    let session = orchestrator
        .get_session(&session_id)
        .await
        .map_err(|error| error.to_string())?;
    println!("session: {session_id}");
    println!("state: {}", session.state);
    println!("tool_calls: {}", session.tool_calls.len());
    for change in &session.file_changes {
        println!("changed: {} ({:?})", change.path, change.action);
    }
    if let Some(summary) = session.summary.as_deref() {
        println!("summary: {summary}");
    }
    if let Some(error) = session.error.as_deref() {
        println!("error: {error}");
    }
    Ok(exit_code_for_state(final_state))
}

async fn decide_permission(
    orchestrator: &Orchestrator,
    session_id: &str,
    event: &AgentEvent,
    mode: PermissionMode,
) -> Result<(), String> {
    let grant = match mode {
        PermissionMode::Approve => true,
        PermissionMode::Deny | PermissionMode::Auto => false,
        PermissionMode::Console => prompt_console(event).await?,
    };
    let result = if grant {
        orchestrator.grant_permission(session_id).await
    } else {
        orchestrator
            .deny_permission(session_id, Some("denied from the console".to_string()))
            .await
    };
    result.map_err(|error| error.to_string())
}

async fn prompt_console(event: &AgentEvent) -> Result<bool, String> {
    let tool = event.payload["tool"].as_str().unwrap_or("tool");
    let reason = event.payload["reason"].as_str().unwrap_or_default();
    let question = format!(
        "\n{tool} needs approval: {reason}\n  args: {}\nallow? [y/N] ",
        event.payload["args"]
    );
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(question.as_bytes())
        .await
        .map_err(|error| error.to_string())?;
    stdout.flush().await.map_err(|error| error.to_string())?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|error| error.to_string())?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_event(event: &AgentEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(_) => print_event_text(event),
        }
    } else {
        print_event_text(event);
    }
}

fn print_event_text(event: &AgentEvent) {
    let detail = match event.kind {
        EventKind::AgentText => event.payload["text"].as_str().unwrap_or_default().to_string(),
        EventKind::ToolStart | EventKind::ToolComplete | EventKind::ToolError => {
            event.payload["tool"].as_str().unwrap_or_default().to_string()
        }
        EventKind::StateChange => format!("{} -> {}", event.payload["from"], event.payload["to"]),
        EventKind::EditDelta | EventKind::FileCreated | EventKind::FileDeleted => {
            event.payload["path"].as_str().unwrap_or_default().to_string()
        }
        EventKind::CmdStart | EventKind::CmdComplete => {
            event.payload["command"].as_str().unwrap_or_default().to_string()
        }
        _ => String::new(),
    };
    println!("[{}] {} {detail}", event.timestamp.format("%H:%M:%S"), event.kind.as_str());
}

fn exit_code_for_state(state: AgentState) -> ExitCode {
    match state {
        AgentState::Done => ExitCode::SUCCESS,
        _ => ExitCode::from(2),
    }
}

fn is_interactive_terminal() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_parses_option_flags_and_permission_mode() {
        let cli = Cli::try_parse_from([
            "tether-cli",
            "run",
            "--workspace",
            "/tmp/project",
            "--prompt",
            "add a test",
            "--auto-run-commands",
            "--system-access",
            "--permissions",
            "approve",
        ])
        .expect("arguments should parse");
        let Commands::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.context.workspace, PathBuf::from("/tmp/project"));
        assert!(args.auto_run_commands);
        assert!(args.system_access);
        assert!(!args.auto_install_deps);
        assert_eq!(args.permissions, PermissionMode::Approve);
    }

    #[test]
    fn plan_requires_a_prompt() {
        let error = Cli::try_parse_from(["tether-cli", "plan", "--workspace", "."])
            .expect_err("missing prompt should fail");
        assert_eq!(error.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn only_done_exits_successfully() {
        assert_eq!(exit_code_for_state(AgentState::Done), ExitCode::SUCCESS);
        assert_eq!(exit_code_for_state(AgentState::Failed), ExitCode::from(2));
        assert_eq!(exit_code_for_state(AgentState::Stopped), ExitCode::from(2));
    }

    #[test]
    fn missing_workspace_is_reported() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let args = ContextArgs {
            workspace: dir.path().join("absent"),
            prompt: "x".to_string(),
            current_file: None,
            model: None,
        };
        let error = context_info(&args).expect_err("absent workspace should fail");
        assert!(error.contains("is not accessible"));
    }
}
