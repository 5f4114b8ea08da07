/// One protocol command: the verb in upper case plus whatever followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: String,
    pub argument: String,
}

/// A wire response, serialized as `CODE message` + CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: String,
    pub message: String,
}

impl Response {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Splits a line into verb and argument at the first space.
///
/// The verb is upper-cased; the argument is the exact remainder, untouched.
/// Any string is syntactically valid, so this never fails; semantic
/// rejection is dispatch's job.
pub fn parse_command(line: &str) -> Command {
    match line.split_once(' ') {
        Some((verb, argument)) => Command {
            verb: verb.to_uppercase(),
            argument: argument.to_string(),
        },
        None => Command {
            verb: line.to_uppercase(),
            argument: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_space_yields_empty_argument() {
        let cmd = parse_command("quit");
        assert_eq!(cmd.verb, "QUIT");
        assert_eq!(cmd.argument, "");
    }

    #[test]
    fn splits_at_first_space_only() {
        let cmd = parse_command("mail  FROM:<a@b>  ");
        assert_eq!(cmd.verb, "MAIL");
        assert_eq!(cmd.argument, " FROM:<a@b>  ");
    }

    #[test]
    fn argument_is_verbatim() {
        let cmd = parse_command("RCPT TO:<c@d> extra words");
        assert_eq!(cmd.verb, "RCPT");
        assert_eq!(cmd.argument, "TO:<c@d> extra words");
    }

    #[test]
    fn empty_line_yields_empty_verb() {
        let cmd = parse_command("");
        assert_eq!(cmd.verb, "");
        assert_eq!(cmd.argument, "");
    }

    #[test]
    fn response_display() {
        let resp = Response::new("250", "OK");
        assert_eq!(resp.to_string(), "250 OK");
    }
}
