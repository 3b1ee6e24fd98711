//! Operator console for `transfer serve`: approval prompts, state changes
//! and folder activity on stdout, commands on stdin.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use transfer_server::approval::ApprovalEvent;
use transfer_server::events::FolderChange;
use transfer_server::storage::LocalFolder;
use transfer_server::{ServerHandle, ServerState};

const HELP: &str = "\
commands:
  allow <ip>          approve a waiting or future client for the approval period
  deny <ip>           reject a waiting client and drop any approval it holds
  pending             list clients waiting for a decision
  approved            list approved clients and their remaining time
  status              show the server state
  start [folder]      start sharing (optionally a different folder)
  stop                stop sharing
  restart             restart the listener
  password <value>    require a password (`password -` removes it)
  approval on|off     toggle per-client approval
  quit                shut down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Allow(IpAddr),
    Deny(IpAddr),
    Pending,
    Approved,
    Status,
    Start(Option<PathBuf>),
    Stop,
    Restart,
    Password(Option<String>),
    Approval(bool),
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let ip = |rest: &[&str]| -> Result<IpAddr, String> {
        match rest {
            [ip] => ip.parse().map_err(|_| format!("not an IP address: {ip}")),
            _ => Err(format!("usage: {verb} <ip>")),
        }
    };

    let cmd = match (verb.to_ascii_lowercase().as_str(), rest.as_slice()) {
        ("allow" | "a" | "y", r) => Command::Allow(ip(r)?),
        ("deny" | "d" | "n", r) => Command::Deny(ip(r)?),
        ("pending", []) => Command::Pending,
        ("approved", []) => Command::Approved,
        ("status", []) => Command::Status,
        ("start", []) => Command::Start(None),
        ("start", _) => Command::Start(Some(PathBuf::from(rest.join(" ")))),
        ("stop", []) => Command::Stop,
        ("restart", []) => Command::Restart,
        ("password", ["-"]) => Command::Password(None),
        ("password", [value]) => Command::Password(Some((*value).to_owned())),
        ("password", _) => return Err("usage: password <value> | password -".into()),
        ("approval", ["on"]) => Command::Approval(true),
        ("approval", ["off"]) => Command::Approval(false),
        ("approval", _) => return Err("usage: approval on|off".into()),
        ("help" | "?", _) => Command::Help,
        ("quit" | "exit", []) => Command::Quit,
        _ => return Err(format!("unknown command: {line}. Type `help`.")),
    };
    Ok(Some(cmd))
}

/// Returns whether the console should keep running.
async fn execute(handle: &ServerHandle, cmd: Command) -> Result<bool> {
    let access = handle.access();
    match cmd {
        Command::Allow(ip) => {
            access.allow(ip);
            println!("{ip} allowed for {}", humantime::format_duration(access.approved().validity()));
        }
        Command::Deny(ip) => {
            access.deny(ip);
            println!("{ip} denied");
        }
        Command::Pending => {
            let pending = access.broker().pending();
            if pending.is_empty() {
                println!("no clients waiting");
            }
            for ip in pending {
                println!("{ip}");
            }
        }
        Command::Approved => {
            let approved = access.approved().snapshot();
            if approved.is_empty() {
                println!("no approved clients");
            }
            for (ip, left) in approved {
                let left = std::time::Duration::from_secs(left.as_secs());
                println!("{ip:<40} {} left", humantime::format_duration(left));
            }
        }
        Command::Status => {
            let settings = handle.settings().current();
            println!("{}", handle.lifecycle.state());
            println!(
                "password: {}, approval: {}, refresh: {}",
                if settings.password().is_some() { "on" } else { "off" },
                if settings.ip_approval { "on" } else { "off" },
                if settings.refresh.enabled {
                    format!("every {}s", settings.refresh.interval_seconds)
                } else {
                    "off".to_owned()
                },
            );
        }
        Command::Start(Some(folder)) => {
            handle.lifecycle.start(Arc::new(LocalFolder::new(folder))).await;
        }
        Command::Start(None) | Command::Restart => {
            handle.lifecycle.restart().await;
        }
        Command::Stop => {
            handle.lifecycle.stop().await;
        }
        Command::Password(password) => {
            handle.settings().set_password(password)?;
            println!("password updated");
        }
        Command::Approval(enabled) => {
            handle.settings().set_ip_approval(enabled)?;
            println!("approval {}", if enabled { "on" } else { "off" });
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn print_approval(event: ApprovalEvent) {
    match event {
        ApprovalEvent::Requested { ip } => {
            println!("{ip} wants access. Type `allow {ip}` or `deny {ip}`.")
        }
        ApprovalEvent::Withdrawn { ip } => println!("{ip} stopped waiting"),
        ApprovalEvent::Resolved { .. } => {}
    }
}

fn print_state(state: &ServerState) {
    match state {
        ServerState::Starting => {}
        ServerState::Running { .. } => println!("{state}"),
        _ => println!("server {state}"),
    }
}

/// Run until `quit`, end of input or ctrl-c.
pub async fn run(handle: &ServerHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut approvals = handle.access().broker().subscribe();
    let mut changes = handle.lifecycle.notifier().subscribe();
    let mut states = handle.lifecycle.subscribe();
    let mut stdin_open = true;

    print_state(&states.borrow_and_update());
    println!("type `help` for commands");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    // Detached from a terminal: keep serving until ctrl-c.
                    stdin_open = false;
                    continue;
                };
                match parse_command(&line) {
                    Ok(Some(cmd)) => {
                        match execute(handle, cmd).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => eprintln!("error: {e:#}"),
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => eprintln!("{msg}"),
                }
            }
            event = approvals.recv() => match event {
                Ok(event) => print_approval(event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            change = changes.recv() => match change {
                Ok(FolderChange::Created { name }) => println!("+ {name}"),
                Ok(FolderChange::Deleted { name }) => println!("- {name}"),
                Err(RecvError::Lagged(n)) => println!("({n} folder changes not shown)"),
                Err(RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                print_state(&state);
            }
        }
    }
    Ok(())
}
