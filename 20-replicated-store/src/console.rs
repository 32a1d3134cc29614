//! Interactive client shell.
//!
//! Parses text commands such as `PUT 1 hello` or `GET 1 consistent` and runs
//! them against the store through a [`StoreClient`].

use anyhow::{anyhow, Result};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::client::StoreClient;

/// Read consistency requested with `GET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLevel {
    Fast,
    Default,
    Consistent,
}

/// Commands that can be entered at the prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: i64, value: String },
    Get { key: i64, level: ReadLevel },
    Leader,
    Exit,
    Help,
}

pub const HELP: &str = "Commands: PUT/p <key> <value>, GET/g <key> [fast|default|consistent], LEADER/l, HELP/h, EXIT/e";

impl ConsoleCommand {
    /// Parses one line of input.
    ///
    /// Commands are case-insensitive and accept one-letter aliases. Keys are
    /// integers; a `PUT` value is the rest of the line, so it may contain spaces.
    /// `GET` defaults to the default read level.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let mut parts = trimmed.splitn(3, char::is_whitespace);
        let Some(first) = parts.next().filter(|word| !word.is_empty()) else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "L" => "LEADER",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        let args: Vec<&str> = parts.map(str::trim).filter(|arg| !arg.is_empty()).collect();
        match (normalized_cmd, args.as_slice()) {
            ("EXIT", []) => Ok(ConsoleCommand::Exit),
            ("HELP", []) => Ok(ConsoleCommand::Help),
            ("LEADER", []) => Ok(ConsoleCommand::Leader),
            ("GET", [key]) => Ok(ConsoleCommand::Get {
                key: parse_key(key)?,
                level: ReadLevel::Default,
            }),
            ("GET", [key, level]) => Ok(ConsoleCommand::Get {
                key: parse_key(key)?,
                level: parse_level(level)?,
            }),
            ("PUT", [key, value]) => Ok(ConsoleCommand::Put {
                key: parse_key(key)?,
                value: value.to_string(),
            }),
            ("GET", _) => Err(anyhow!("GET takes a key and an optional level: GET <key> [level]")),
            ("PUT", _) => Err(anyhow!("PUT requires two arguments: PUT <key> <value>")),
            ("EXIT" | "HELP" | "LEADER", _) => Err(anyhow!("{normalized_cmd} takes no arguments")),
            _ => Err(anyhow!("invalid command. {HELP}")),
        }
    }
}

fn parse_key(raw: &str) -> Result<i64> {
    raw.parse()
        .map_err(|_| anyhow!("key must be an integer, got {raw:?}"))
}

fn parse_level(raw: &str) -> Result<ReadLevel> {
    match raw.to_lowercase().as_str() {
        "f" | "fast" => Ok(ReadLevel::Fast),
        "d" | "default" => Ok(ReadLevel::Default),
        "c" | "consistent" => Ok(ReadLevel::Consistent),
        other => Err(anyhow!("unknown read level {other:?}")),
    }
}

/// Runs the prompt on stdin until EXIT or end of input.
pub async fn run(client: StoreClient) -> Result<()> {
    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();
    let mut line = String::new();

    stdout.write_all(format!("{HELP}\n").as_bytes()).await?;
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        line.clear();
        if stdin.read_line(&mut line).await? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let output = match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Exit) => break,
            Ok(command) => execute(&client, command).await,
            Err(err) => format!("error: {err}"),
        };
        stdout.write_all(format!("{output}\n").as_bytes()).await?;
    }
    Ok(())
}

async fn execute(client: &StoreClient, command: ConsoleCommand) -> String {
    let result = match command {
        ConsoleCommand::Put { key, value } => client.write(key, value).await.map(|()| "OK".to_string()),
        ConsoleCommand::Get { key, level } => match level {
            ReadLevel::Fast => client.fast_read(key).await,
            ReadLevel::Default => client.default_read(key).await,
            ReadLevel::Consistent => client.consistent_read(key).await,
        },
        ConsoleCommand::Leader => Ok(client
            .leader()
            .await
            .unwrap_or_else(|| "unknown".to_string())),
        ConsoleCommand::Help => Ok(HELP.to_string()),
        ConsoleCommand::Exit => Ok(String::new()),
    };
    result.unwrap_or_else(|err| format!("error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_commands() {
        assert!(matches!(ConsoleCommand::parse("exit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("ExIt"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("quit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("HELP"), Ok(ConsoleCommand::Help)));
        assert!(matches!(ConsoleCommand::parse("leader"), Ok(ConsoleCommand::Leader)));
    }

    #[test]
    fn test_aliases() {
        assert!(matches!(ConsoleCommand::parse("e"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("h"), Ok(ConsoleCommand::Help)));
        assert!(matches!(ConsoleCommand::parse("L"), Ok(ConsoleCommand::Leader)));
        assert_eq!(
            ConsoleCommand::parse("g 7").ok(),
            Some(ConsoleCommand::Get {
                key: 7,
                level: ReadLevel::Default
            })
        );
        assert_eq!(
            ConsoleCommand::parse("P 7 seven").ok(),
            Some(ConsoleCommand::Put {
                key: 7,
                value: "seven".into()
            })
        );
    }

    #[test]
    fn test_read_levels() {
        for (raw, level) in [
            ("fast", ReadLevel::Fast),
            ("F", ReadLevel::Fast),
            ("default", ReadLevel::Default),
            ("Consistent", ReadLevel::Consistent),
            ("c", ReadLevel::Consistent),
        ] {
            assert_eq!(
                ConsoleCommand::parse(&format!("GET -3 {raw}")).ok(),
                Some(ConsoleCommand::Get { key: -3, level })
            );
        }
    }

    #[test]
    fn test_put_value_keeps_inner_spaces() {
        assert_eq!(
            ConsoleCommand::parse("put 1 hello  wide world ").ok(),
            Some(ConsoleCommand::Put {
                key: 1,
                value: "hello  wide world".into()
            })
        );
    }

    #[test]
    fn test_invalid_commands() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("INVALID").is_err());
        assert!(ConsoleCommand::parse("GET").is_err());
        assert!(ConsoleCommand::parse("GET one").is_err());
        assert!(ConsoleCommand::parse("GET 1 eventually").is_err());
        assert!(ConsoleCommand::parse("PUT 1").is_err());
        assert!(ConsoleCommand::parse("EXIT now").is_err());
    }
}
