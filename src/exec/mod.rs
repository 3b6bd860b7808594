pub mod executor;

pub use executor::{ExecuteError, ExecutionRequest, ExecutionResult, SandboxExecutor};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("unbalanced quote in command")]
pub struct UnbalancedQuote;

/// Split raw command text into an argument vector without a shell.
///
/// Single and double quotes group words; inside double quotes a backslash
/// escapes the next character. No expansion of any kind happens here, which
/// is the point: what the validator counted is exactly what gets spawned.
pub fn tokenize(command: &str) -> Result<Vec<String>, UnbalancedQuote> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;

    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            '\\' if in_double => match chars.next() {
                Some(next) => current.push(next),
                None => return Err(UnbalancedQuote),
            },
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if in_single || in_double {
        return Err(UnbalancedQuote);
    }

    if has_token {
        args.push(current);
    }

    Ok(args)
}

/// Quote an argument so that `tokenize` reproduces it verbatim.
pub fn quote(arg: &str) -> String {
    let needs_quoting = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '\\');

    if !needs_quoting {
        return arg.to_string();
    }

    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
