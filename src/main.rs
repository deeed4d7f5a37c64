// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use streamdag::actors::standard_registry;
use streamdag::environment::state::StateStore;
use streamdag::environment::Environment;
use streamdag::graph::NodeState;

/// Run an actor DAG that turns prompts into model output.
#[derive(Parser)]
#[command(name = "streamdag", version)]
struct Cli {
    /// Model to run (e.g. "gpt", "gpt4o")
    model: String,

    /// Prompt item; "-" reads standard input. Repeatable.
    #[arg(long = "prompt", value_name = "TEXT")]
    prompts: Vec<String>,

    /// Enable a built-in tool. Repeatable.
    #[arg(long = "tool", value_name = "NAME")]
    tools: Vec<String>,

    /// Runtime option actors see on their env stream. Repeatable.
    #[arg(long = "opt", value_name = "KEY=VALUE", value_parser = parse_opt)]
    opts: Vec<(String, String)>,

    /// Print the dependency tree instead of running.
    #[arg(long)]
    dry_run: bool,

    /// Execute a single observable step, then exit.
    #[arg(long)]
    one_step: bool,

    /// Stop before the named node (or alias) starts.
    #[arg(long, value_name = "NODE")]
    stop_before: Option<String>,

    /// Stop after the named node (or alias) completes.
    #[arg(long, value_name = "NODE")]
    stop_after: Option<String>,

    /// Save finished-node state to a SQLite file on exit.
    #[arg(long, value_name = "FILE")]
    save_state: Option<PathBuf>,

    /// Load state saved by --save-state instead of building a new flow.
    #[arg(long, value_name = "FILE")]
    load_state: Option<PathBuf>,

    /// Persist the whole key-stream space to a SQLite file on exit.
    #[arg(long, value_name = "FILE")]
    file_system: Option<PathBuf>,

    /// Spool `out/` keys into a directory on exit.
    #[arg(long, value_name = "DIR")]
    download_to: Option<PathBuf>,

    /// Verbose internal logging.
    #[arg(long)]
    debug: bool,
}

fn parse_opt(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

/// Short model names people actually type, mapped to concrete model ids.
fn resolve_model(model: &str) -> &str {
    match model {
        "gpt4o" => "gpt-4o-mini",
        "gpt" => "gpt-4.1-nano",
        "chatgpt" => "chatgpt-4o-latest",
        other => other,
    }
}

fn read_prompt_item(item: &str) -> std::io::Result<String> {
    if item == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else {
        Ok(item.to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("streamdag=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let env = Environment::new(standard_registry());
    env.opts
        .set("llm.model", Value::String(resolve_model(&cli.model).to_string()));
    for (key, value) in &cli.opts {
        env.opts.set(key, Value::String(value.clone()));
    }

    if let Some(path) = &cli.load_state {
        let items = match StateStore::open(path).and_then(|store| store.load()) {
            Ok(items) => items,
            Err(e) => {
                eprintln!("streamdag: cannot load state from {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = env.restore(&items) {
            eprintln!("streamdag: cannot restore state: {}", e);
            return ExitCode::FAILURE;
        }
    } else {
        for tool in &cli.tools {
            if let Err(e) = env.register_tool(tool) {
                eprintln!("streamdag: unknown tool '{}': {}", tool, e);
                return ExitCode::FAILURE;
            }
        }
        let prompt_items = if cli.prompts.is_empty() {
            vec!["-".to_string()]
        } else {
            cli.prompts.clone()
        };
        for item in &prompt_items {
            let text = match read_prompt_item(item) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("streamdag: cannot read prompt: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = env.add_prompt(&text) {
                eprintln!("streamdag: cannot add prompt: {}", e);
                return ExitCode::FAILURE;
            }
        }
        if let Err(e) = env.build_flow("gpt.pipeline") {
            eprintln!("streamdag: cannot build flow: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let mut scheduler = env.scheduler();
    if let Some(node) = &cli.stop_before {
        scheduler.stop_before(node);
    }
    if let Some(node) = &cli.stop_after {
        scheduler.stop_after(node);
    }

    if cli.dry_run {
        print!("{}", scheduler.dry_run());
        return exit_for(&env);
    }

    let outcome = if cli.one_step {
        scheduler.one_step().await
    } else {
        scheduler.run().await
    };
    match outcome {
        Ok(outcome) => tracing::debug!(?outcome, "drive returned"),
        Err(e) => {
            eprintln!("streamdag: scheduler error: {}", e);
            return ExitCode::FAILURE;
        }
    }

    match env.end_bytes().await {
        Ok(bytes) => {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(&bytes);
            let _ = stdout.flush();
        }
        Err(e) => eprintln!("streamdag: cannot read output: {}", e),
    }

    if let Some(path) = &cli.save_state {
        if let Err(e) = StateStore::open(path).and_then(|store| store.save(&env.snapshot())) {
            eprintln!("streamdag: cannot save state to {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    }
    if let Some(path) = &cli.file_system {
        let items: Vec<(String, Vec<u8>)> = env
            .kv
            .keys()
            .into_iter()
            .filter_map(|key| env.kv.get(&key).map(|pipe| (key, pipe.contents())))
            .collect();
        if let Err(e) = StateStore::open(path).and_then(|store| store.save(&items)) {
            eprintln!(
                "streamdag: cannot persist key space to {}: {}",
                path.display(),
                e
            );
            return ExitCode::FAILURE;
        }
    }
    if let Some(dir) = &cli.download_to {
        for key in env.kv.keys() {
            let rest = match key.strip_prefix("out/") {
                Some(rest) => rest,
                None => continue,
            };
            let pipe = match env.kv.get(&key) {
                Some(pipe) => pipe,
                None => continue,
            };
            let target = dir.join(rest.replace('/', "_"));
            if let Err(e) =
                std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&target, pipe.contents()))
            {
                eprintln!("streamdag: cannot write {}: {}", target.display(), e);
            }
        }
    }

    let code = exit_for(&env);
    env.teardown();
    code
}

fn exit_for(env: &Environment) -> ExitCode {
    match env.end_state() {
        Some(NodeState::Failed) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}
