use std::path::PathBuf;

use thiserror::Error;

/// One parsed control-socket request.
///
/// The wire format is a single line of command-plus-arguments per
/// connection; keeping a tagged variant here isolates the brittle string
/// handling from the state machine, which only ever sees this enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// The component state table.
    Status,
    /// Capabilities and their providers.
    Capabilities,
    /// A component's dependency tree.
    Tree(String),
    /// Components that depend on the named one, transitively.
    Rdeps(String),
    /// Impact report for removing a component, without mutating state.
    SimulateRemove(String),
    /// The dependency graph in tabular text form.
    Graph,
    /// Tail of a component's captured output.
    Logs { name: String, lines: usize },
    /// Force a readiness poll now.
    Poll,
    Upgrade(String),
    Checkpoint(String),
    Restore(String),
    CheckpointList(Option<String>),
    CheckpointRemove { name: String, id: String },
    /// Move a checkpoint from the transient to the persistent store.
    Migrate { name: String, id: String },
    /// Run cycle detection and report the witness.
    Cycles,
    Metrics,
    /// Validate the currently loaded graph.
    Validate,
    Kexec {
        kernel: PathBuf,
        initrd: Option<PathBuf>,
        dry_run: bool,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("empty request")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("'{command}' requires a {what} argument")]
    MissingArgument {
        command: &'static str,
        what: &'static str,
    },

    #[error("bad argument for '{command}': {what}")]
    BadArgument {
        command: &'static str,
        what: String,
    },
}

impl ControlError {
    /// Stable numeric code for the daemon's log line.
    pub fn code(&self) -> u32 {
        match self {
            ControlError::Empty => 100,
            ControlError::UnknownCommand(_) => 101,
            ControlError::MissingArgument { .. } => 102,
            ControlError::BadArgument { .. } => 103,
        }
    }
}

/// Render a failure the way every handler reports it on the wire.
pub fn error_line(msg: impl std::fmt::Display) -> String {
    format!("Error: {}\n", msg)
}

impl Request {
    pub fn parse(line: &str) -> Result<Request, ControlError> {
        let mut words = line.split_whitespace();
        let command = words.next().ok_or(ControlError::Empty)?;
        let rest: Vec<&str> = words.collect();

        let need_name = |command: &'static str| -> Result<String, ControlError> {
            rest.first()
                .map(|s| s.to_string())
                .ok_or(ControlError::MissingArgument { command, what: "component" })
        };

        match command {
            "status" => Ok(Request::Status),
            "caps" | "capabilities" => Ok(Request::Capabilities),
            "tree" => Ok(Request::Tree(need_name("tree")?)),
            "rdeps" => Ok(Request::Rdeps(need_name("rdeps")?)),
            "simulate-remove" => Ok(Request::SimulateRemove(need_name("simulate-remove")?)),
            "graph" => Ok(Request::Graph),
            "logs" => {
                let name = need_name("logs")?;
                let lines = match rest.get(1) {
                    None => 10,
                    Some(n) => n.parse().map_err(|_| ControlError::BadArgument {
                        command: "logs",
                        what: format!("line count '{}'", n),
                    })?,
                };
                Ok(Request::Logs { name, lines })
            }
            "poll" => Ok(Request::Poll),
            "upgrade" => Ok(Request::Upgrade(need_name("upgrade")?)),
            "checkpoint" => Ok(Request::Checkpoint(need_name("checkpoint")?)),
            "restore" => Ok(Request::Restore(need_name("restore")?)),
            "checkpoint-list" => Ok(Request::CheckpointList(rest.first().map(|s| s.to_string()))),
            "checkpoint-remove" => {
                let name = need_name("checkpoint-remove")?;
                let id = rest.get(1).map(|s| s.to_string()).ok_or(
                    ControlError::MissingArgument {
                        command: "checkpoint-remove",
                        what: "checkpoint id",
                    },
                )?;
                Ok(Request::CheckpointRemove { name, id })
            }
            "migrate" => {
                let name = need_name("migrate")?;
                let id = rest.get(1).map(|s| s.to_string()).ok_or(
                    ControlError::MissingArgument {
                        command: "migrate",
                        what: "checkpoint id",
                    },
                )?;
                Ok(Request::Migrate { name, id })
            }
            "cycles" => Ok(Request::Cycles),
            "metrics" => Ok(Request::Metrics),
            "validate" => Ok(Request::Validate),
            "kexec" => {
                let mut dry_run = false;
                let mut paths = Vec::new();
                for arg in &rest {
                    if *arg == "--dry-run" {
                        dry_run = true;
                    } else {
                        paths.push(PathBuf::from(arg));
                    }
                }
                let mut paths = paths.into_iter();
                let kernel = paths.next().ok_or(ControlError::MissingArgument {
                    command: "kexec",
                    what: "kernel image",
                })?;
                Ok(Request::Kexec {
                    kernel,
                    initrd: paths.next(),
                    dry_run,
                })
            }
            other => Err(ControlError::UnknownCommand(other.to_string())),
        }
    }
}
