//! Command validation gate for shell-level tool calls.
//!
//! A command line is allowed when its leading program is allowlisted and, for
//! the handful of programs that can escalate (search with execution, process
//! kill, permission change, script execution), its arguments pass the rules of
//! that program's family. This is not a general shell parser: everything after
//! the leading program is ignored for unrestricted programs.

use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::ValidationVerdict;

/// Programs permitted by default.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    // File inspection
    "ls", "cat", "head", "tail", "wc", "grep", "find",
    // File operations
    "cp", "mkdir", "chmod", "pwd", "echo",
    // Node.js development
    "npm", "npx", "pnpm", "node",
    // Version control
    "git",
    // Process management
    "ps", "lsof", "sleep", "pkill",
    // Project scripts
    "init.sh", "bash", "sh",
];

/// Process names `pkill` may target.
pub const KILLABLE_PROCESSES: &[&str] = &["node", "npm", "npx", "vite", "next"];

const FIND_FORBIDDEN_ACTIONS: &[&str] = &["-exec", "-execdir", "-delete", "-ok", "-okdir"];

static EXECUTE_ONLY_MODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ugoa]*\+x$").expect("chmod mode pattern is valid"));

/// Default allowlist as an owned set.
pub fn default_allowed_commands() -> BTreeSet<String> {
    DEFAULT_ALLOWED_COMMANDS
        .iter()
        .map(|name| (*name).to_string())
        .collect()
}

/// Argument-rule family of an allowlisted program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    /// `find`: relative search roots, no executing or deleting actions.
    Find,
    /// `pkill`: only development process names.
    ProcessKill,
    /// `chmod`: only `+x` modes.
    PermissionChange,
    /// `init.sh`: only the project's own setup script.
    InitScript,
    /// `bash` / `sh`: no inline `-c` programs.
    ShellInterpreter,
    /// Everything else: the allowlist check is the whole policy.
    Unrestricted,
}

impl CommandFamily {
    pub fn classify(program: &str) -> Self {
        match program {
            "find" => Self::Find,
            "pkill" => Self::ProcessKill,
            "chmod" => Self::PermissionChange,
            "init.sh" => Self::InitScript,
            "bash" | "sh" => Self::ShellInterpreter,
            _ => Self::Unrestricted,
        }
    }
}

/// Leading program plus tokenized arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Leading token exactly as written (may include a path).
    pub invocation: String,
    /// Leading token with any path stripped.
    pub program: String,
    pub args: Vec<String>,
}

/// Split a command line into its leading program and arguments.
///
/// Quotes are honored when balanced; otherwise tokens fall back to plain
/// whitespace splitting. Returns `None` for a blank line.
pub fn parse_command_line(command_line: &str) -> Option<ParsedCommand> {
    let tokens = shell_words::split(command_line).unwrap_or_else(|_| {
        command_line
            .split_whitespace()
            .map(str::to_string)
            .collect()
    });
    let mut tokens = tokens.into_iter();
    let invocation = tokens.next().filter(|token| !token.is_empty())?;
    let program = invocation
        .rsplit('/')
        .next()
        .unwrap_or(invocation.as_str())
        .to_string();
    Some(ParsedCommand {
        invocation,
        program,
        args: tokens.collect(),
    })
}

/// Decide whether `command_line` may run.
pub fn validate(command_line: &str, allowed_commands: &BTreeSet<String>) -> ValidationVerdict {
    let Some(parsed) = parse_command_line(command_line) else {
        return ValidationVerdict::deny("empty command");
    };
    if !allowed_commands.contains(&parsed.program) {
        return ValidationVerdict::deny(format!("unknown command '{}'", parsed.program));
    }

    let family = CommandFamily::classify(&parsed.program);
    let outcome = match family {
        CommandFamily::Find => check_find(&parsed.args),
        CommandFamily::ProcessKill => check_pkill(&parsed.args),
        CommandFamily::PermissionChange => check_chmod(&parsed.args),
        CommandFamily::InitScript => check_init_script(&parsed.invocation),
        CommandFamily::ShellInterpreter => check_shell(&parsed.program, &parsed.args),
        CommandFamily::Unrestricted => Ok(()),
    };

    match outcome {
        Ok(()) => ValidationVerdict::allow(format!("'{}' is allowed", parsed.program)),
        Err(reason) => ValidationVerdict::deny(reason),
    }
}

fn check_find(args: &[String]) -> Result<(), String> {
    if let Some(action) = args
        .iter()
        .find(|arg| FIND_FORBIDDEN_ACTIONS.contains(&arg.as_str()))
    {
        return Err(format!("find action '{action}' is not allowed"));
    }
    // With no explicit start path, find searches the current directory.
    for start in find_start_paths(args) {
        if !start.starts_with('.') {
            return Err(format!(
                "find must search the project directory (got '{start}'; use '.' or './subdir')"
            ));
        }
        if escapes_upward(start) {
            return Err(format!("find path '{start}' leaves the project directory"));
        }
    }
    Ok(())
}

/// Start paths of a `find` invocation: the operands between the leading
/// symlink/debug options and the first expression token.
fn find_start_paths(args: &[String]) -> Vec<&str> {
    let mut rest = args.iter().map(String::as_str).peekable();
    while let Some(&arg) = rest.peek() {
        match arg {
            "-H" | "-L" | "-P" => {
                rest.next();
            }
            "-D" => {
                rest.next();
                rest.next();
            }
            _ if arg.starts_with("-O") => {
                rest.next();
            }
            _ => break,
        }
    }
    rest.take_while(|arg| !arg.starts_with(['-', '(', '!', ',']))
        .collect()
}

fn check_pkill(args: &[String]) -> Result<(), String> {
    let targets: Vec<&String> = args.iter().filter(|arg| !arg.starts_with('-')).collect();
    if targets.is_empty() {
        return Err("pkill requires a process name".to_string());
    }
    for target in targets {
        if !KILLABLE_PROCESSES.contains(&target.as_str()) {
            return Err(format!(
                "pkill may only target dev processes ({}), got '{target}'",
                KILLABLE_PROCESSES.join(", ")
            ));
        }
    }
    Ok(())
}

fn check_chmod(args: &[String]) -> Result<(), String> {
    if let Some(flag) = args.iter().find(|arg| arg.starts_with('-')) {
        return Err(format!("chmod option or mode '{flag}' is not allowed"));
    }
    let Some((mode, files)) = args.split_first() else {
        return Err("chmod requires a mode and a file".to_string());
    };
    if files.is_empty() {
        return Err("chmod requires a mode and a file".to_string());
    }
    for part in mode.split(',') {
        if !EXECUTE_ONLY_MODE.is_match(part) {
            return Err(format!(
                "chmod mode '{mode}' is not allowed (only +x, u+x, a+x style modes)"
            ));
        }
    }
    Ok(())
}

fn check_init_script(invocation: &str) -> Result<(), String> {
    let path = Path::new(invocation);
    let is_init = path.file_name().is_some_and(|name| name == "init.sh");
    // A bare `init.sh` would be resolved through PATH, not the project.
    if !is_init || !invocation.contains('/') {
        return Err(format!(
            "only the project's init.sh may run (use ./init.sh), got '{invocation}'"
        ));
    }
    if path.is_absolute() || escapes_upward(invocation) {
        return Err(format!(
            "init.sh must be inside the project directory, got '{invocation}'"
        ));
    }
    Ok(())
}

fn check_shell(program: &str, args: &[String]) -> Result<(), String> {
    // Options end at the script operand; what follows belongs to the script.
    let script_at = args
        .iter()
        .position(|arg| !arg.starts_with('-'))
        .unwrap_or(args.len());
    let (options, script_args) = args.split_at(script_at);
    let inline = options
        .iter()
        .any(|arg| !arg.starts_with("--") && arg[1..].contains('c'))
        || script_args.iter().any(|arg| arg == "-c");
    if inline {
        return Err(format!("{program} -c is not allowed; run a script file instead"));
    }
    if let Some(script) = script_args.first()
        && (Path::new(script).is_absolute() || escapes_upward(script))
    {
        return Err(format!(
            "{program} may only run scripts inside the project directory, got '{script}'"
        ));
    }
    Ok(())
}

fn escapes_upward(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|component| matches!(component, Component::ParentDir))
}
