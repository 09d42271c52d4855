/// An operator command recognized at the start of a trimmed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Reload,
    Op(String),
    Deop(String),
    Halt,
    /// `!op`/`!deop` with a missing or malformed name
    SyntaxError,
}

/// Names that can be given to `!op` and `!deop`.
const NAME_PATTERN: &str = r"[A-Za-z0-9.@_-]+";

/// Match `input` against the operator commands, first match wins:
/// `!reload`, `!op`, `!deop`, `!halt`. Prefixes are case-sensitive and
/// anything after `!reload`/`!halt` is ignored.
pub fn parse(input: &str) -> Option<Command> {
    if input.starts_with("!reload") {
        Some(Command::Reload)
    } else if input.starts_with("!op") {
        Some(name_argument("!op", input).map_or(Command::SyntaxError, Command::Op))
    } else if input.starts_with("!deop") {
        Some(name_argument("!deop", input).map_or(Command::SyntaxError, Command::Deop))
    } else if input.starts_with("!halt") {
        Some(Command::Halt)
    } else {
        None
    }
}

fn name_argument(command: &str, input: &str) -> Option<String> {
    let re = regex::Regex::new(&format!(r"^{} ({})$", command, NAME_PATTERN)).ok()?;
    let caps = re.captures(input)?;
    Some(caps.get(1)?.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_messages_are_not_commands() {
        assert_eq!(parse("hello"), None);
        assert_eq!(parse("say !reload"), None);
        assert_eq!(parse("!RELOAD"), None);
        assert_eq!(parse("!help"), None);
    }

    #[test]
    fn test_reload_ignores_trailing_text() {
        assert_eq!(parse("!reload"), Some(Command::Reload));
        assert_eq!(parse("!reload extra text"), Some(Command::Reload));
    }

    #[test]
    fn test_halt() {
        assert_eq!(parse("!halt"), Some(Command::Halt));
        assert_eq!(parse("!halt now please"), Some(Command::Halt));
    }

    #[test]
    fn test_op_and_deop_names() {
        assert_eq!(parse("!op carol"), Some(Command::Op("carol".to_string())));
        assert_eq!(
            parse("!op console-bob.smith@example_1"),
            Some(Command::Op("console-bob.smith@example_1".to_string()))
        );
        assert_eq!(parse("!deop carol"), Some(Command::Deop("carol".to_string())));
    }

    #[test]
    fn test_malformed_names_are_syntax_errors() {
        assert_eq!(parse("!op bad name!"), Some(Command::SyntaxError));
        assert_eq!(parse("!op"), Some(Command::SyntaxError));
        assert_eq!(parse("!op "), Some(Command::SyntaxError));
        assert_eq!(parse("!opcarol"), Some(Command::SyntaxError));
        assert_eq!(parse("!deop a/b"), Some(Command::SyntaxError));
    }
}
