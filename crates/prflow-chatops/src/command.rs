//! Slash-command extraction from comment bodies.

use std::sync::LazyLock;

use regex::Regex;

static COMMAND_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/([A-Za-z0-9][A-Za-z0-9_-]*)(?:\s+(.*))?$").expect("command pattern is valid")
});

/// A command found in a comment, e.g. `/approve cancel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Every command in `body`, one per line that starts with `/`.
///
/// Lines that do not look like a command are skipped.
pub fn extract_commands(body: &str) -> Vec<Command> {
    body.lines()
        .filter_map(|line| {
            let caps = COMMAND_LINE.captures(line.trim())?;
            let args = caps
                .get(2)
                .map(|m| m.as_str().split_whitespace().map(String::from).collect())
                .unwrap_or_default();
            Some(Command {
                name: caps[1].to_string(),
                args,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_command() {
        assert_eq!(extract_commands("/approve"), vec![Command::new("approve", &[])]);
    }

    #[test]
    fn test_arguments_split_on_whitespace() {
        assert_eq!(
            extract_commands("/approve   cancel  now"),
            vec![Command::new("approve", &["cancel", "now"])]
        );
    }

    #[test]
    fn test_multiple_commands_and_prose() {
        let body = "Looks good to me.\n\n/ci-approve\nthanks!\n  /approve check\r\n";
        assert_eq!(
            extract_commands(body),
            vec![
                Command::new("ci-approve", &[]),
                Command::new("approve", &["check"]),
            ]
        );
    }

    #[test]
    fn test_no_commands() {
        assert!(extract_commands("").is_empty());
        assert!(extract_commands("see /approve inline").is_empty());
        assert!(extract_commands("/ nothing").is_empty());
        assert!(extract_commands("//approve").is_empty());
    }
}
