#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clawgate::command::resolve::{resolve, ResolverContext};
use clawgate::command::shell::{parse_shell, AnalyzedCommand};
use clawgate::gatekeeper::events::TracingSink;
use clawgate::security::{final_decision, ApprovalInput, Decision, DecisionInput, EvalContext};
use clawgate::{
    AllowlistStore, ApprovalManager, Config, ExecRequest, Gatekeeper, NativeExecutor, Policy,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "clawgate", about = "Command execution gatekeeper", version)]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true, default_value = "clawgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate a shell command against the policy and print the decision
    Check {
        /// Agent whose policy applies
        #[arg(long)]
        agent: Option<String>,
        /// The shell command to evaluate
        command: Vec<String>,
    },
    /// Read one JSON exec request on stdin, run the full pipeline, print the reply
    Run,
    /// Inspect or update the persistent allowlist
    Allowlist {
        #[command(subcommand)]
        command: AllowlistCommands,
    },
}

#[derive(Subcommand, Debug)]
enum AllowlistCommands {
    /// List all entries
    List,
    /// Add an entry for an absolute program path
    Add {
        /// Absolute canonical program path
        pattern: PathBuf,
        /// Restrict the entry to one agent (global when omitted)
        #[arg(long)]
        agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Check { agent, command } => check(&config, agent.as_deref(), &command),
        Commands::Run => run(config).await,
        Commands::Allowlist { command } => allowlist(&config, command),
    }
}

fn check(config: &Config, agent: Option<&str>, command: &[String]) -> Result<()> {
    anyhow::ensure!(!command.is_empty(), "no command given");
    let command_line = command.join(" ");

    let policy = Policy::resolve(config, agent);
    let allowlist = AllowlistStore::load(config.allowlist_path())?;

    let mut analysis = parse_shell(&command_line);
    resolve_segments(&mut analysis, &policy);
    let evaluation = allowlist.evaluate(&analysis, agent);

    let input = DecisionInput {
        analysis_ok: analysis.ok,
        allowlist_satisfied: evaluation.satisfied,
        approval: ApprovalInput::default(),
        needs_screen_recording: false,
        outer_is_cmd_exe: false,
    };
    let decision = final_decision(&policy, &input, &EvalContext::default());

    println!("command:   {command_line}");
    println!("analyzed:  {}", if analysis.ok { "ok" } else { "not analyzable" });
    for segment in &analysis.segments {
        let program = segment.argv.first().map(String::as_str).unwrap_or("");
        match &segment.resolution {
            Some(r) => println!(
                "  segment:  {program} -> {} ({:?})",
                r.resolved_path.display(),
                r.resolved_via
            ),
            None => println!("  segment:  {program} (unresolved)"),
        }
    }
    println!(
        "allowlist: {}",
        if evaluation.satisfied { "satisfied" } else { "not satisfied" }
    );
    match decision {
        Decision::Allow => println!("decision:  allow"),
        Decision::Ask => println!("decision:  ask"),
        Decision::Deny(reason) => println!("decision:  deny ({reason})"),
    }
    Ok(())
}

fn resolve_segments(analysis: &mut AnalyzedCommand, policy: &Policy) {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let env = std::collections::HashMap::new();
    let ctx = ResolverContext {
        cwd: &cwd,
        env: &env,
        safe_bins: &policy.safe_bins,
        skill_bins: &policy.skill_bins,
        auto_allow_skills: policy.auto_allow_skills,
    };
    for segment in &mut analysis.segments {
        if let Some(program) = segment.argv.first() {
            segment.resolution = Some(resolve(program, &ctx));
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read request from stdin")?;
    let request: ExecRequest =
        serde_json::from_str(&input).context("Failed to parse exec request JSON")?;

    let allowlist = Arc::new(AllowlistStore::load(config.allowlist_path())?);
    let approvals = Arc::new(ApprovalManager::new(config.approvals.ttl_ms));
    let executor = Arc::new(NativeExecutor::new(config.exec.env_passthrough.clone()));
    let events = Arc::new(TracingSink);

    let gatekeeper = Gatekeeper::new(Arc::new(config), allowlist, approvals, executor, events);
    let reply = gatekeeper.handle(request).await;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

fn allowlist(config: &Config, command: AllowlistCommands) -> Result<()> {
    let store = AllowlistStore::load(config.allowlist_path())?;
    match command {
        AllowlistCommands::List => {
            let entries = store.entries();
            if entries.is_empty() {
                println!("allowlist is empty");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{}\tagent={}\tuses={}\tlast={:?}",
                    entry.pattern,
                    entry.agent_id.as_deref().unwrap_or("*"),
                    entry.use_count,
                    entry.last_cmd_text
                );
            }
        }
        AllowlistCommands::Add { pattern, agent } => {
            let inserted = store.add_entry(agent.as_deref(), &pattern)?;
            if inserted {
                println!("added {}", pattern.display());
            } else {
                println!("already present: {}", pattern.display());
            }
        }
    }
    Ok(())
}
