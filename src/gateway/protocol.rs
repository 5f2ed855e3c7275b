//! TeamTalk 5 text protocol: line-oriented `command key="value" key2=42`
//! framing in both directions.
//!
//! Client commands may carry an `id=N` parameter; the server brackets the
//! matching reply between `begin id=N` and `end id=N` lines, with `ok` or
//! `error number=… message="…"` as the reply terminator inside the bracket.
//! Everything outside a bracket is a server-pushed event.

use std::collections::HashMap;

use super::GatewayError;

/// Escape a string value for the wire: backslash and double quote.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Builder for an outgoing command line.
#[derive(Debug)]
pub struct Command {
    line: String,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Command { line: name.to_string() }
    }

    pub fn str(mut self, key: &str, value: &str) -> Self {
        self.line.push_str(&format!(" {key}=\"{}\"", escape(value)));
        self
    }

    pub fn int(mut self, key: &str, value: i64) -> Self {
        self.line.push_str(&format!(" {key}={value}"));
        self
    }

    pub fn opt_str(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.str(key, v),
            None => self,
        }
    }

    /// Final wire form, without the trailing CRLF.
    pub fn encode(self) -> String {
        self.line
    }
}

/// A parsed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    /// Bare token that is neither quoted nor numeric (e.g. a list `[1,2]`).
    Raw(String),
}

/// Parameters of a parsed server line.
#[derive(Debug, Clone, Default)]
pub struct Params(HashMap<String, Value>);

impl Params {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::Str(s)) | Some(Value::Raw(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(Value::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get_int(key).and_then(|n| u32::try_from(n).ok())
    }
}

/// One parsed line from the server.
#[derive(Debug, Clone)]
pub struct ServerLine {
    pub command: String,
    pub params: Params,
}

/// Parse a raw line. Returns `None` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<ServerLine>, GatewayError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut chars = line.chars().peekable();

    // Command word.
    let mut command = String::new();
    while let Some(&c) = chars.peek() {
        if c == ' ' {
            break;
        }
        command.push(c);
        chars.next();
    }
    if command.is_empty() {
        return Ok(None);
    }

    let mut params = HashMap::new();
    loop {
        // Skip separators.
        while chars.peek() == Some(&' ') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        // Key up to '='.
        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if key.is_empty() {
            return Err(GatewayError::Protocol(format!("malformed parameter in line: {line}")));
        }

        // Value: quoted string, or bare token.
        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let mut s = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some('r') => s.push('\r'),
                        Some('n') => s.push('\n'),
                        Some(other) => s.push(other),
                        None => break,
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => s.push(other),
                }
            }
            if !closed {
                return Err(GatewayError::Protocol(format!("unterminated string in line: {line}")));
            }
            Value::Str(s)
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                token.push(c);
                chars.next();
            }
            match token.parse::<i64>() {
                Ok(n) => Value::Int(n),
                Err(_) => Value::Raw(token),
            }
        };
        params.insert(key, value);
    }

    Ok(Some(ServerLine { command, params: Params(params) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encodes_command_with_quoting() {
        let cmd = Command::new("login")
            .str("username", "reg bot")
            .str("password", "se\"cret\\x")
            .int("protocol", 5)
            .encode();
        assert_eq!(cmd, r#"login username="reg bot" password="se\"cret\\x" protocol=5"#);
    }

    #[test]
    fn parses_quoted_and_numeric_params() {
        let line = parse_line(r#"useraccount username="alice" usertype=1 userrights=259591"#)
            .unwrap()
            .unwrap();
        assert_eq!(line.command, "useraccount");
        assert_eq!(line.params.get_str("username"), Some("alice"));
        assert_eq!(line.params.get_int("usertype"), Some(1));
        assert_eq!(line.params.get_u32("userrights"), Some(259_591));
    }

    #[test]
    fn parses_escapes_inside_strings() {
        let line = parse_line(r#"error number=2006 message="invalid \"account\"""#)
            .unwrap()
            .unwrap();
        assert_eq!(line.command, "error");
        assert_eq!(line.params.get_u32("number"), Some(2006));
        assert_eq!(line.params.get_str("message"), Some(r#"invalid "account""#));
    }

    #[test]
    fn roundtrips_reserved_characters() {
        let encoded = Command::new("message").int("type", 3).str("content", "a \"b\" \\c").encode();
        let parsed = parse_line(&encoded).unwrap().unwrap();
        assert_eq!(parsed.params.get_str("content"), Some("a \"b\" \\c"));
    }

    #[test]
    fn blank_line_is_none() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("\r\n").unwrap().is_none());
    }

    #[test]
    fn bare_list_token_is_raw() {
        let line = parse_line("ok cmdlist=[1,2,3]").unwrap().unwrap();
        assert_eq!(line.params.get_str("cmdlist"), Some("[1,2,3]"));
    }
}
