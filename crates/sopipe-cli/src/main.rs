use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use sopipe_core::{ChatMessage, ContextItem, ContextSink};
use sopipe_local::config::{load_config, ConfigPaths, LoadedConfig, ModelLayer, SettingsLayer};
use sopipe_local::openai_compat::OpenAiCompatModel;
use sopipe_local::slash::{CommandContext, SlashCommand, StackOverflowCommand};
use sopipe_local::LocalFetcher;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "sopipe")]
#[command(about = "Search Stack Overflow and answer with a language model", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search Stack Overflow, fit the best answers into the model's context and stream its answer.
    So(SoCmd),
    /// Diagnose configuration issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct SoCmd {
    /// The question (remaining words are joined with spaces).
    #[arg(required = true, num_args = 1..)]
    query: Vec<String>,
    /// Prior conversation as a JSON array of `{role, content}` messages.
    #[arg(long)]
    history_file: Option<PathBuf>,
    /// Workspace directory holding `.sopipe/config.json` (default: current directory).
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Search proxy base URL (overrides settings and SOPIPE_PROXY_URL).
    #[arg(long)]
    proxy_url: Option<String>,
    /// Model base URL for the OpenAI-compatible chat endpoint.
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    context_length: Option<usize>,
    /// Output format: text|json (json = one event per line)
    #[arg(long = "output", alias = "format", default_value = "text")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Workspace directory holding `.sopipe/config.json` (default: current directory).
    #[arg(long)]
    workspace: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // stdout carries command output; logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn load_env_file() {
    // Opt-in only; never overrides the explicit process env and never logs values.
    let Ok(p) = std::env::var("SOPIPE_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim();
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

fn load(workspace: Option<&Path>, overrides: SettingsLayer) -> Result<LoadedConfig> {
    let paths = ConfigPaths::discover(workspace);
    let loaded = load_config(&paths, overrides)?;
    for w in &loaded.warnings {
        tracing::warn!(warning = %w, "settings file ignored");
    }
    Ok(loaded)
}

fn read_history(path: &Path) -> Result<Vec<ChatMessage>> {
    let raw = std::fs::read_to_string(path)?;
    let history: Vec<ChatMessage> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("history file {}: {e}", path.display()))?;
    Ok(history)
}

async fn run_so(args: SoCmd) -> Result<()> {
    let t0 = std::time::Instant::now();
    let json = match args.output.to_ascii_lowercase().as_str() {
        "json" => true,
        "text" => false,
        other => anyhow::bail!("unknown output format: {other} (allowed: text, json)"),
    };

    let overrides = SettingsLayer {
        proxy_url: args.proxy_url,
        model: Some(ModelLayer {
            base_url: args.base_url,
            model: args.model,
            context_length: args.context_length,
            ..ModelLayer::default()
        }),
        ..SettingsLayer::default()
    };
    let settings = load(args.workspace.as_deref(), overrides)?.settings;

    let client = sopipe_local::http_client()?;
    let cmd = StackOverflowCommand::from_proxy(client.clone(), settings.require_proxy()?)?;
    let llm = Arc::new(OpenAiCompatModel::from_settings(
        client.clone(),
        &settings.model,
    )?);
    let history = match &args.history_file {
        Some(p) => read_history(p)?,
        None => Vec::new(),
    };

    let sink: Arc<dyn ContextSink> = Arc::new(move |item: ContextItem| {
        if json {
            println!(
                "{}",
                serde_json::json!({ "kind": "context_item", "item": item })
            );
        } else {
            eprintln!("[{}] {}", item.name, item.id.item_id);
        }
    });

    let ctx = CommandContext {
        llm,
        input: args.query.join(" "),
        history,
        fetch: Arc::new(LocalFetcher::with_client(client)),
        context: sink,
    };
    tracing::debug!(command = cmd.name(), "running slash command");
    let mut out = cmd.run(ctx);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stdout = std::io::stdout();
    let mut chunks = 0usize;
    let mut cancelled = false;
    loop {
        tokio::select! {
            next = out.next() => match next {
                Some(Ok(chunk)) => {
                    chunks += 1;
                    if json {
                        println!("{}", serde_json::json!({ "kind": "chunk", "text": chunk }));
                    } else {
                        write!(stdout, "{chunk}")?;
                        stdout.flush()?;
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
            _ = &mut ctrl_c => {
                out.cancel();
                cancelled = true;
                break;
            }
        }
    }

    if json {
        println!(
            "{}",
            serde_json::json!({ "kind": "done", "chunks": chunks, "cancelled": cancelled })
        );
    } else {
        println!();
    }
    if settings.telemetry_enabled {
        tracing::info!(
            target: "sopipe::telemetry",
            command = "so",
            chunks,
            cancelled,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "command finished"
        );
    }
    Ok(())
}

fn doctor(args: DoctorCmd) -> Result<serde_json::Value> {
    let t0 = std::time::Instant::now();
    let mut checks: Vec<serde_json::Value> = Vec::new();

    let loaded = match load(args.workspace.as_deref(), SettingsLayer::default()) {
        Ok(l) => l,
        Err(e) => {
            checks.push(serde_json::json!({
                "name": "settings_resolve",
                "ok": false,
                "message": e.to_string(),
                "hint": "Fix proxy_url / context_length in settings or SOPIPE_* env.",
            }));
            return Ok(serde_json::json!({
                "schema_version": 1,
                "kind": "doctor",
                "ok": false,
                "name": "sopipe",
                "version": env!("CARGO_PKG_VERSION"),
                "checks": checks,
                "elapsed_ms": t0.elapsed().as_millis(),
            }));
        }
    };
    let s = &loaded.settings;

    let files_ok = loaded.warnings.is_empty();
    checks.push(serde_json::json!({
        "name": "settings_files_parse",
        "ok": files_ok,
        "message": if files_ok { "settings files parse".to_string() } else { loaded.warnings.join("; ") },
        "hint": if files_ok { "" } else { "Fix or remove the listed settings files." },
    }));
    let proxy_ok = s.proxy.is_some();
    checks.push(serde_json::json!({
        "name": "search_proxy",
        "ok": proxy_ok,
        "message": if proxy_ok { "search proxy configured" } else { "search proxy not configured" },
        "hint": if proxy_ok { "" } else { "Set SOPIPE_PROXY_URL or proxy_url in settings." },
    }));
    let model_ok = s.model.base_url.is_some() && s.model.model.is_some();
    checks.push(serde_json::json!({
        "name": "chat_model",
        "ok": model_ok,
        "message": if model_ok { "chat model configured" } else { "chat model not configured" },
        "hint": if model_ok { "" } else { "Set SOPIPE_OPENAI_COMPAT_BASE_URL and SOPIPE_OPENAI_COMPAT_MODEL." },
    }));

    // Booleans only for secrets.
    Ok(serde_json::json!({
        "schema_version": 1,
        "kind": "doctor",
        "ok": files_ok && proxy_ok && model_ok,
        "name": "sopipe",
        "version": env!("CARGO_PKG_VERSION"),
        "configured": {
            "proxy": proxy_ok,
            "proxy_access_token": s.proxy.as_ref().is_some_and(|p| p.access_token.is_some()),
            "model": {
                "provider": s.model.provider,
                "base_url": s.model.base_url.is_some(),
                "api_key": s.model.api_key.is_some(),
                "model": s.model.model.is_some(),
                "context_length": s.model.context_length,
            },
            "telemetry_enabled": s.telemetry_enabled,
            "settings_files": loaded.sources.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        },
        "checks": checks,
        "elapsed_ms": t0.elapsed().as_millis(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::So(args) => run_so(args).await?,
        Commands::Doctor(args) => {
            let v = doctor(args)?;
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "sopipe",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("sopipe {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
        }
    }
    Ok(())
}
