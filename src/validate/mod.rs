//! Argument validation, run before any resource is touched.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::ValidationConfig;
use crate::error::ExecError;

static TRAVERSAL_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Path traversal in either separator convention, anywhere in an argument.
fn traversal_pattern() -> &'static Regex {
    TRAVERSAL_PATTERN.get_or_init(|| Regex::new(r"\.\.[/\\]").unwrap())
}

const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '<', '>', '(', ')', '\n', '\r'];

fn invalid(message: impl Into<String>) -> ExecError {
    ExecError::Validation {
        message: message.into(),
    }
}

/// Validate a command's arguments against the configured limits.
///
/// Pure: no side effects, no resource access. Every rejection names the
/// offending argument so callers can report without re-parsing.
pub fn validate(args: &[String], config: &ValidationConfig) -> Result<(), ExecError> {
    if args.len() > config.max_args {
        return Err(invalid(format!(
            "{} arguments exceeds limit of {}",
            args.len(),
            config.max_args
        )));
    }

    for arg in args {
        check_argument(arg, config)?;
    }

    check_numeric_flags(args, config)?;
    check_conflicting_flags(args, config)?;

    Ok(())
}

fn check_argument(arg: &str, config: &ValidationConfig) -> Result<(), ExecError> {
    if arg.len() > config.max_arg_len {
        return Err(invalid(format!(
            "argument of {} bytes exceeds limit of {}",
            arg.len(),
            config.max_arg_len
        )));
    }

    if arg.contains('\0') {
        return Err(invalid("argument contains a NUL byte"));
    }

    if let Some(c) = arg.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(invalid(format!(
            "argument contains shell metacharacter {:?}: {}",
            c,
            truncate(arg)
        )));
    }

    if traversal_pattern().is_match(arg) {
        return Err(invalid(format!(
            "argument contains path traversal: {}",
            truncate(arg)
        )));
    }

    let lower = arg.to_lowercase();
    for keyword in &config.denied_keywords {
        if lower.contains(&keyword.to_lowercase()) {
            return Err(invalid(format!(
                "argument matches denied pattern {:?}: {}",
                keyword,
                truncate(arg)
            )));
        }
    }

    Ok(())
}

/// Bounds-check `--timeout` and `--workers`/`-j`, in both `--flag=value` and
/// `--flag value` spellings.
fn check_numeric_flags(args: &[String], config: &ValidationConfig) -> Result<(), ExecError> {
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        let (flag, value) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value.to_string())),
            None => (arg.as_str(), args.get(i + 1).cloned()),
        };

        match flag {
            "--timeout" => {
                let secs = parse_flag_value(flag, value.as_deref())?;
                if secs < config.min_timeout_secs || secs > config.max_timeout_secs {
                    return Err(invalid(format!(
                        "--timeout {} outside [{}, {}]",
                        secs, config.min_timeout_secs, config.max_timeout_secs
                    )));
                }
            }
            "--workers" | "-j" => {
                let workers = parse_flag_value(flag, value.as_deref())?;
                if workers == 0 || workers > config.max_workers {
                    return Err(invalid(format!(
                        "{} {} outside [1, {}]",
                        flag, workers, config.max_workers
                    )));
                }
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

fn parse_flag_value(flag: &str, value: Option<&str>) -> Result<u64, ExecError> {
    let raw = value.ok_or_else(|| invalid(format!("{} requires a value", flag)))?;
    raw.parse::<u64>()
        .map_err(|_| invalid(format!("{} value {:?} is not a number", flag, raw)))
}

fn check_conflicting_flags(args: &[String], config: &ValidationConfig) -> Result<(), ExecError> {
    for (a, b) in &config.conflicting_flags {
        if args.iter().any(|arg| arg == a) && args.iter().any(|arg| arg == b) {
            return Err(invalid(format!("{} conflicts with {}", a, b)));
        }
    }
    Ok(())
}

fn truncate(arg: &str) -> String {
    const MAX: usize = 48;
    if arg.chars().count() <= MAX {
        arg.to_string()
    } else {
        let prefix: String = arg.chars().take(MAX).collect();
        format!("{}…", prefix)
    }
}
