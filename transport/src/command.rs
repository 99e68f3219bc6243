//! Text commands as they travel inside command packets:
//!
//! ```ascii
//! <name> <key>=<value> <key>=<value>|<key>=<value> -<trigger>
//! ```
//!
//! `|` separates the bulks of a command; all bulks share the name. Values are escaped so that
//!  they never contain spaces, pipes or control characters.

use std::fmt::{Display, Formatter};
use thiserror::Error;

pub fn escape(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            ' ' => result.push_str("\\s"),
            '/' => result.push_str("\\/"),
            '|' => result.push_str("\\p"),
            '\x08' => result.push_str("\\b"),
            '\x0C' => result.push_str("\\f"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            '\x07' => result.push_str("\\a"),
            '\x0B' => result.push_str("\\v"),
            ch => result.push(ch),
        }
    }
    result
}

/// Unknown escape sequences are kept verbatim
pub fn unescape(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            result.push(ch);
            continue;
        }

        let replacement = match chars.peek() {
            Some('s') => ' ',
            Some('/') => '/',
            Some('p') => '|',
            Some('b') => '\x08',
            Some('f') => '\x0C',
            Some('n') => '\n',
            Some('r') => '\r',
            Some('t') => '\t',
            Some('a') => '\x07',
            Some('v') => '\x0B',
            Some('\\') => '\\',
            _ => {
                result.push('\\');
                continue;
            }
        };
        chars.next();
        result.push(replacement);
    }
    result
}

/// The error ids that this layer reports to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Ok = 0x0000,
    CommandNotFound = 0x0100,
    ClientNotLoggedIn = 0x0206,
    ClientCouldNotValidateIdentity = 0x0207,
    ClientTypeIsNotAllowed = 0x0215,
    ParameterInvalid = 0x0602,
    ParameterMissing = 0x0606,
    VsCritical = 0x0700,
    WhisperTooManyTargets = 0x070B,
    WhisperNoTargets = 0x070C,
    WebHandshakeInvalid = 0x1000,
    WebHandshakeUnsupported = 0x1001,
    WebHandshakeIdentityProofFailed = 0x1003,
}

impl ErrorCode {
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::CommandNotFound => "command not found",
            ErrorCode::ClientNotLoggedIn => "not logged in",
            ErrorCode::ClientCouldNotValidateIdentity => "could not validate client identity",
            ErrorCode::ClientTypeIsNotAllowed => "client type is not allowed to join the server",
            ErrorCode::ParameterInvalid => "invalid parameter",
            ErrorCode::ParameterMissing => "missing required parameter",
            ErrorCode::VsCritical => "virtual server got a critical error",
            ErrorCode::WhisperTooManyTargets => "too many whisper targets",
            ErrorCode::WhisperNoTargets => "no whisper targets found",
            ErrorCode::WebHandshakeInvalid => "Invalid handshake",
            ErrorCode::WebHandshakeUnsupported => "Handshake intention unsupported",
            ErrorCode::WebHandshakeIdentityProofFailed => "Identity proof failed",
        }
    }
}

/// An error that is reported back to the client as an `error` command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({code:?})")]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
    pub extra: Option<String>,
}

impl CommandError {
    pub fn new(code: ErrorCode) -> CommandError {
        CommandError {
            code,
            message: code.default_message().to_string(),
            extra: None,
        }
    }

    pub fn with_extra(code: ErrorCode, extra: impl Into<String>) -> CommandError {
        CommandError {
            extra: Some(extra.into()),
            ..CommandError::new(code)
        }
    }

    pub fn parameter_missing(key: &str) -> CommandError {
        CommandError::with_extra(ErrorCode::ParameterMissing, key)
    }

    pub fn parameter_invalid(key: &str) -> CommandError {
        CommandError::with_extra(ErrorCode::ParameterInvalid, key)
    }

    /// `error id=.. msg=.. [extra_msg=..] [return_code=..]`
    pub fn build_response(&self, return_code: Option<&str>) -> Command {
        build_error_response(self.code.id(), &self.message, self.extra.as_deref(), return_code)
    }
}

/// the response for successfully handled commands that carry a `return_code`
pub fn build_ok_response(return_code: Option<&str>) -> Command {
    build_error_response(ErrorCode::Ok.id(), ErrorCode::Ok.default_message(), None, return_code)
}

fn build_error_response(id: u16, message: &str, extra: Option<&str>, return_code: Option<&str>) -> Command {
    let mut response = Command::new("error")
        .with("id", id)
        .with("msg", message);
    if let Some(extra) = extra {
        response.set("extra_msg", extra);
    }
    if let Some(return_code) = return_code {
        response.set("return_code", return_code);
    }
    response
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("command is not valid UTF-8")]
    InvalidUtf8,
}

/// A parsed or to-be-built text command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    /// key/value pairs per bulk, in order; there is always at least one bulk
    bulks: Vec<Vec<(String, String)>>,
    triggers: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Command {
        Command {
            name: name.into(),
            bulks: vec![Vec::new()],
            triggers: Vec::new(),
        }
    }

    pub fn parse_bytes(data: &[u8]) -> Result<Command, CommandParseError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| CommandParseError::InvalidUtf8)?;
        Command::parse(text)
    }

    pub fn parse(text: &str) -> Result<Command, CommandParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CommandParseError::Empty);
        }

        let mut command = Command::new("");
        command.bulks.clear();

        for (bulk_idx, bulk_text) in text.split('|').enumerate() {
            let mut bulk = Vec::new();
            for (token_idx, token) in bulk_text.split(' ').filter(|t| !t.is_empty()).enumerate() {
                match token.split_once('=') {
                    Some((key, value)) => bulk.push((key.to_string(), unescape(value))),
                    None if bulk_idx == 0 && token_idx == 0 => command.name = token.to_string(),
                    None if token.starts_with('-') => command.triggers.push(token[1..].to_string()),
                    None => bulk.push((token.to_string(), String::new())),
                }
            }
            command.bulks.push(bulk);
        }

        Ok(command)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bulk_count(&self) -> usize {
        self.bulks.len()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_in(0, key)
    }

    pub fn get_in(&self, bulk: usize, key: &str) -> Option<&str> {
        self.bulks.get(bulk)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// a mandatory parameter of the first bulk
    pub fn require(&self, key: &str) -> Result<&str, CommandError> {
        self.get(key)
            .ok_or_else(|| CommandError::parameter_missing(key))
    }

    pub fn has_trigger(&self, trigger: &str) -> bool {
        self.triggers.iter().any(|t| t == trigger)
    }

    pub fn set(&mut self, key: &str, value: impl Display) {
        self.set_in(0, key, value);
    }

    pub fn set_in(&mut self, bulk: usize, key: &str, value: impl Display) {
        while self.bulks.len() <= bulk {
            self.bulks.push(Vec::new());
        }

        let value = value.to_string();
        let bulk = &mut self.bulks[bulk];
        match bulk.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => bulk.push((key.to_string(), value)),
        }
    }

    pub fn with(mut self, key: &str, value: impl Display) -> Command {
        self.set(key, value);
        self
    }

    pub fn with_trigger(mut self, trigger: &str) -> Command {
        self.triggers.push(trigger.to_string());
        self
    }

    pub fn build(&self) -> String {
        let mut result = self.name.clone();
        for (idx, bulk) in self.bulks.iter().enumerate() {
            if idx > 0 {
                result.push('|');
            }
            for (key, value) in bulk {
                if !result.is_empty() && !result.ends_with('|') {
                    result.push(' ');
                }
                result.push_str(key);
                if !value.is_empty() {
                    result.push('=');
                    result.push_str(&escape(value));
                }
            }
        }
        for trigger in &self.triggers {
            result.push_str(" -");
            result.push_str(trigger);
        }
        result
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("abc", "abc")]
    #[case::space("a b", "a\\sb")]
    #[case::pipe("a|b", "a\\pb")]
    #[case::slash("a/b", "a\\/b")]
    #[case::backslash("a\\b", "a\\\\b")]
    #[case::newline("a\nb\t", "a\\nb\\t")]
    #[case::unicode("grüße 🎧", "grüße\\s🎧")]
    fn test_escape(#[case] raw: &str, #[case] escaped: &str) {
        assert_eq!(escape(raw), escaped);
        assert_eq!(unescape(escaped), raw);
    }

    #[test]
    fn test_unescape_unknown_sequence() {
        assert_eq!(unescape("a\\xb"), "a\\xb");
        assert_eq!(unescape("trailing\\"), "trailing\\");
    }

    #[test]
    fn test_parse() {
        let command = Command::parse("clientinitiv alpha=YWJj\\/ omega=xyz ot=1 ip -teaspeak").unwrap();
        assert_eq!(command.name(), "clientinitiv");
        assert_eq!(command.get("alpha"), Some("YWJj/"));
        assert_eq!(command.get("omega"), Some("xyz"));
        assert_eq!(command.get("ot"), Some("1"));
        assert_eq!(command.get("ip"), Some(""));
        assert_eq!(command.get("missing"), None);
        assert!(command.has_trigger("teaspeak"));
        assert!(!command.has_trigger("other"));
    }

    #[test]
    fn test_parse_bulks() {
        let command = Command::parse("clientmove clid=1 cid=3|clid=2|clid=5").unwrap();
        assert_eq!(command.bulk_count(), 3);
        assert_eq!(command.get_in(0, "cid"), Some("3"));
        assert_eq!(command.get_in(2, "clid"), Some("5"));
        assert_eq!(command.get_in(3, "clid"), None);
    }

    #[rstest]
    #[case::empty("")]
    #[case::blank("   ")]
    fn test_parse_empty(#[case] text: &str) {
        assert_eq!(Command::parse(text), Err(CommandParseError::Empty));
    }

    #[test]
    fn test_parse_bytes_invalid_utf8() {
        assert_eq!(Command::parse_bytes(&[b'a', 0xFF]), Err(CommandParseError::InvalidUtf8));
    }

    #[test]
    fn test_build() {
        let mut command = Command::new("initivexpand")
            .with("alpha", "a b")
            .with("beta", 12);
        command.set_in(1, "omega", "x|y");
        command.set("beta", 13);
        assert_eq!(command.build(), "initivexpand alpha=a\\sb beta=13|omega=x\\py");

        let parsed = Command::parse(&command.build()).unwrap();
        assert_eq!(parsed, command);
    }

    #[rstest]
    #[case::no_return_code(CommandError::new(ErrorCode::CommandNotFound), None, "error id=256 msg=command\\snot\\sfound")]
    #[case::return_code(CommandError::new(ErrorCode::ParameterInvalid), Some("rc1"), "error id=1538 msg=invalid\\sparameter return_code=rc1")]
    #[case::extra(CommandError::parameter_missing("alpha"), None, "error id=1542 msg=missing\\srequired\\sparameter extra_msg=alpha")]
    fn test_error_response(#[case] error: CommandError, #[case] return_code: Option<&str>, #[case] expected: &str) {
        assert_eq!(error.build_response(return_code).build(), expected);
    }

    #[test]
    fn test_ok_response() {
        assert_eq!(build_ok_response(Some("x")).build(), "error id=0 msg=ok return_code=x");
    }
}
