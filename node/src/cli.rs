use std::io::{self, BufRead, Write};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::kernel::{InjectRequest, Kernel};

/// What one command produced: text for the operator, or the signal to
/// leave the loop.
pub enum CommandOutcome {
    Output(String),
    Exit,
}

/// Interactive SEED loop. Reads one command per line until `exit` or
/// EOF.
pub fn run(kernel: &Arc<Kernel>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("hydra> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                eprintln!("error reading input: {err}");
                continue;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match execute(kernel, line) {
            CommandOutcome::Output(text) => println!("{text}"),
            CommandOutcome::Exit => break,
        }
    }
}

/// Parse and run a single command line.
pub fn execute(kernel: &Arc<Kernel>, line: &str) -> CommandOutcome {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    let output = match command {
        "caps" => list_capabilities(kernel),
        "cap" => show_capability(kernel, rest),
        "activate" => match kernel.loader().activate(rest) {
            Ok(()) => format!("{rest} active"),
            Err(err) => format!("activation failed: {err}"),
        },
        "deactivate" => {
            if kernel.loader().deactivate(rest) {
                format!("{rest} suspended")
            } else {
                format!("{rest} is not active")
            }
        }
        "stream" => kernel
            .registry()
            .export()
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n"),
        "inject" => match serde_json::from_str::<InjectRequest>(rest) {
            Ok(request) => match kernel.inject(request) {
                Ok((id, hash)) => format!("injected {id} ({hash})"),
                Err(err) => format!("inject failed: {err}"),
            },
            Err(err) => format!("inject expects a manifest request as JSON: {err}"),
        },
        "evolve" => match rest.split_once(char::is_whitespace) {
            Some((id, source)) if !source.trim().is_empty() => {
                match kernel.evolve(id, source.trim()) {
                    Ok(true) => format!("{id} evolved"),
                    Ok(false) => format!("{id} refused the swap (not hot-swappable)"),
                    Err(err) => format!("evolve failed: {err}"),
                }
            }
            _ => "usage: evolve <id> <source>".to_string(),
        },
        "nodes" => list_nodes(kernel),
        "health" => pretty(&serde_json::to_value(kernel.hardware()).unwrap_or(Value::Null)),
        "status" => pretty(&kernel.cluster_status()),
        "jobs" => list_jobs(kernel),
        "run" => match rest.split_once(char::is_whitespace) {
            Some((job_type, spec)) => match serde_json::from_str::<Value>(spec.trim()) {
                Ok(spec) => {
                    let id = kernel.submit_job(job_type, spec, None);
                    format!("job {id} queued")
                }
                Err(err) => format!("run expects a JSON spec: {err}"),
            },
            None => "usage: run <type> <spec>".to_string(),
        },
        "help" => HELP.to_string(),
        "exit" | "quit" => return CommandOutcome::Exit,
        other => format!("unknown command: '{other}' (try 'help')"),
    };

    CommandOutcome::Output(output)
}

const HELP: &str = "\
commands:
  caps                      list registered capabilities
  cap <id>                  show one capability in full
  activate <id>             activate a capability and its dependencies
  deactivate <id>           suspend an active capability
  stream                    dump every manifest as NDJSON
  inject <json>             build and register a capability from source
  evolve <id> <source>      hot-swap a capability's source
  nodes                     list known peers
  health                    hardware snapshot
  status                    cluster status
  jobs                      list jobs
  run <type> <spec>         submit a job
  help                      this text
  exit                      shut down";

fn list_capabilities(kernel: &Arc<Kernel>) -> String {
    let mut lines = Vec::new();
    for manifest in kernel.registry().all() {
        let state = kernel
            .loader()
            .state(&manifest.id)
            .map(|state| state.to_string())
            .unwrap_or_else(|| "declared".to_string());
        lines.push(format!(
            "{:<24} {:<10} {:<10} {}",
            manifest.id, manifest.kind, state, manifest.genome_hash
        ));
    }
    if lines.is_empty() {
        "no capabilities registered".to_string()
    } else {
        lines.join("\n")
    }
}

fn show_capability(kernel: &Arc<Kernel>, id: &str) -> String {
    match kernel.registry().get(id) {
        Some(manifest) => {
            let mut out = pretty(&serde_json::to_value(&manifest).unwrap_or(Value::Null));
            if let Some(status) = kernel.loader().status(id) {
                out.push_str(&format!("\nstate: {}", status.state));
            }
            out
        }
        None => format!("no capability registered as '{id}'"),
    }
}

fn list_nodes(kernel: &Arc<Kernel>) -> String {
    let peers = kernel.peers().get_peers();
    if peers.is_empty() {
        return "no peers discovered".to_string();
    }
    peers
        .iter()
        .map(|peer| {
            let age = (Utc::now() - peer.last_seen).num_seconds();
            format!(
                "{:<18} {:<16} {:<16} seen {age}s ago, {} caps",
                peer.id,
                peer.addr,
                peer.hw_tag,
                peer.capability_ids.len()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn list_jobs(kernel: &Arc<Kernel>) -> String {
    let jobs = kernel.scheduler().list();
    if jobs.is_empty() {
        return "no jobs".to_string();
    }
    jobs.iter()
        .map(|job| {
            let exit = job
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string());
            format!(
                "{:<38} {:<10} {:<10} exit {exit}",
                job.id,
                job.job_type,
                format!("{:?}", job.status).to_lowercase()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
