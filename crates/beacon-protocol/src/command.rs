//! Parsing operator input lines.
//!
//! The grammar is one command per line:
//!
//! ```text
//! exit                  stop the hub
//! keys                  list canned message keys (the whole line)
//! json <key> [key ...]  broadcast canned messages, in order
//! <anything else>       broadcast the line as typed
//! ```
//!
//! Command words and keys are case-insensitive; literal broadcasts keep
//! their original case.

use thiserror::Error;

/// Command word that stops the hub
pub const EXIT: &str = "exit";

/// Command word that broadcasts canned messages
pub const JSON: &str = "json";

/// Command word that lists canned message keys
pub const KEYS: &str = "keys";

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Broadcast the trimmed line verbatim
    Broadcast(String),

    /// Broadcast the canned messages for these keys (lower-cased)
    Canned(Vec<String>),

    /// Print the available canned message keys. Only a bare `keys` line;
    /// `keys` followed by more words is a broadcast.
    ListKeys,

    /// Begin shutdown
    Exit,
}

/// Rejected operator input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("input a valid command")]
    Empty,

    #[error("input at least one canned message key after 'json'")]
    MissingKeys,
}

/// Parses one line of operator input.
///
/// # Errors
///
/// - `CommandError::Empty` for blank lines
/// - `CommandError::MissingKeys` for `json` without keys
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let mut words = line.split_whitespace();

    let Some(first) = words.next() else {
        return Err(CommandError::Empty);
    };

    match first.to_lowercase().as_str() {
        EXIT => Ok(Command::Exit),
        KEYS if words.next().is_none() => Ok(Command::ListKeys),
        JSON => {
            let keys: Vec<String> = words.map(str::to_lowercase).collect();
            if keys.is_empty() {
                Err(CommandError::MissingKeys)
            } else {
                Ok(Command::Canned(keys))
            }
        }
        _ => Ok(Command::Broadcast(line.to_string())),
    }
}
