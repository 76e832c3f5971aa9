//! Interactive console for driving a [`ServerManager`].
//!
//! Each input line is one shell command; [`Shell::handle`] returns the text to
//! print so the command set can be exercised without a terminal.

use crate::error::{AppResult, EmulatorError};
use crate::monitor::CommandLog;
use crate::network::ServerManager;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

const PROMPT: &str = "scpi> ";
const DEFAULT_LOG_LINES: usize = 20;

const HELP: &str = "\
Commands:
  load <file>             Load a CSV command table (replaces all instruments)
  start [name]            Start one instrument, or all
  stop [name]             Stop one instrument, or all
  restart <name>          Restart an instrument
  status [json]           Show every instrument
  send <name> <command>   Send a SCPI command and print the response
  clear <name>            Device clear (restore defaults)
  log [n]                 Show the last n exchanges (default 20)
  stats                   Show traffic statistics
  help                    Show this help
  quit                    Stop all servers and exit";

/// Result of one shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading; print the text if non-empty.
    Continue(String),
    /// Stop every server and exit.
    Quit,
}

/// Line-oriented console over a [`ServerManager`].
pub struct Shell {
    manager: Arc<ServerManager>,
    log: CommandLog,
}

impl Shell {
    /// A shell over `manager`, reading history from `log`.
    #[must_use]
    pub fn new(manager: Arc<ServerManager>, log: CommandLog) -> Self {
        Self { manager, log }
    }

    /// Reads commands from stdin until `quit` or end of input.
    pub async fn run(&self) -> AppResult<()> {
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        stdout.write_all(b"Type 'help' for commands.\n").await?;
        loop {
            stdout.write_all(PROMPT.as_bytes()).await?;
            stdout.flush().await?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            match self.handle(&line).await {
                Flow::Quit => break,
                Flow::Continue(text) if text.is_empty() => {}
                Flow::Continue(text) => {
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                }
            }
        }
        Ok(())
    }

    /// Executes one shell command.
    pub async fn handle(&self, line: &str) -> Flow {
        let line = line.trim();
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        debug!(command, args = rest, "Shell command");

        let output = match command.to_ascii_lowercase().as_str() {
            "" => Ok(String::new()),
            "quit" | "exit" => return Flow::Quit,
            "help" => Ok(HELP.to_string()),
            "load" if rest.is_empty() => Ok("usage: load <file>".to_string()),
            "load" => self
                .manager
                .load_table(rest)
                .await
                .map(|n| format!("Loaded {n} instruments")),
            "start" => self.start(rest).await,
            "stop" => self.stop(rest).await,
            "restart" if rest.is_empty() => Ok("usage: restart <name>".to_string()),
            "restart" => self
                .manager
                .restart_instrument(rest)
                .await
                .map(|addr| format!("Restarted on {addr}")),
            "status" if rest.eq_ignore_ascii_case("json") => self.status_json().await,
            "status" => Ok(self.status().await),
            "send" => self.send(rest).await,
            "clear" if rest.is_empty() => Ok("usage: clear <name>".to_string()),
            "clear" => self
                .manager
                .device_clear(rest)
                .await
                .map(|()| "Device cleared".to_string()),
            "log" => Ok(self.recent_log(rest)),
            "stats" => Ok(self.stats()),
            other => Ok(format!("Unknown command '{other}'. Type 'help'.")),
        };

        Flow::Continue(output.unwrap_or_else(|e| format!("Error: {e}")))
    }

    async fn start(&self, name: &str) -> AppResult<String> {
        if name.is_empty() {
            let started = self.manager.start_all().await?;
            let mut out = format!("Started {} instruments", started.len());
            for addr in started {
                let _ = write!(out, "\n  {addr}");
            }
            return Ok(out);
        }
        let addr = self.manager.start_instrument(name).await?;
        Ok(format!("Started on {addr}"))
    }

    async fn stop(&self, name: &str) -> AppResult<String> {
        if name.is_empty() {
            self.manager.stop_all().await?;
            return Ok("Stopped all instruments".to_string());
        }
        self.manager.stop_instrument(name).await?;
        Ok("Stopped".to_string())
    }

    async fn send(&self, args: &str) -> AppResult<String> {
        let Some((name, command)) = args.split_once(char::is_whitespace) else {
            return Ok("usage: send <name> <command>".to_string());
        };
        let response = self.manager.send_command(name, command.trim()).await?;
        if response.is_empty() {
            Ok("(no response)".to_string())
        } else {
            Ok(response)
        }
    }

    async fn status(&self) -> String {
        let statuses = self.manager.statuses().await;
        if statuses.is_empty() {
            return "No instruments loaded".to_string();
        }
        statuses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn status_json(&self) -> AppResult<String> {
        let statuses = self.manager.statuses().await;
        serde_json::to_string_pretty(&statuses)
            .map_err(|e| EmulatorError::Configuration(format!("cannot encode status: {e}")))
    }

    fn recent_log(&self, args: &str) -> String {
        let limit = args.parse().unwrap_or(DEFAULT_LOG_LINES);
        let entries = self.log.recent(limit);
        if entries.is_empty() {
            return "No commands logged".to_string();
        }
        entries
            .iter()
            .map(|e| {
                let mut line = format!(
                    "{} [{}] {} -> {}",
                    e.timestamp.format("%H:%M:%S%.3f"),
                    e.instrument_name,
                    e.command,
                    if e.response.is_empty() { "(none)" } else { &e.response }
                );
                if let Some(code) = e.error_code {
                    let _ = write!(line, " (error {code})");
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn stats(&self) -> String {
        let stats = self.log.stats();
        let uptime = std::time::Duration::from_secs(stats.uptime.as_secs());
        format!(
            "Commands: {}\nErrors: {}\nCommands/min: {}\nUptime: {}",
            stats.total_commands,
            stats.errors,
            stats.commands_per_minute,
            humantime::format_duration(uptime)
        )
    }
}
