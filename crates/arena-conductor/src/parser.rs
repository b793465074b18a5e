use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const SUBMIT_API: &str = "submit";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Error parsing response: {message}")]
pub struct ParseError {
    pub message: String,
    pub offset: Option<usize>,
}

impl ParseError {
    fn at(offset: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            offset: Some(offset),
        }
    }

    fn general(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            offset: None,
        }
    }
}

/// One API call extracted from an agent action.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub api_name: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl ParsedCall {
    pub fn is_submission(&self) -> bool {
        self.api_name == SUBMIT_API
    }
}

/// Parses agent text into a single call of the form `name(arg, ..., key=value)`.
///
/// When the text contains fenced code blocks, only the last block is
/// considered. A bare identifier is a call without arguments. Literal
/// arguments follow Python/JSON spelling: quoted strings, numbers,
/// `True`/`False`/`None` (or `true`/`false`/`null`), lists and string-keyed
/// dicts.
pub fn parse_response(text: &str) -> Result<ParsedCall, ParseError> {
    let body = extract_call_text(text);
    if body.is_empty() {
        return Err(ParseError::general("No API call found!"));
    }
    let mut cursor = Cursor::new(body);
    let call = cursor.parse_call()?;
    cursor.skip_ws();
    if !cursor.at_end() {
        return Err(ParseError::at(
            cursor.pos,
            "unexpected trailing text after the API call",
        ));
    }
    Ok(call)
}

fn extract_call_text(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(last_close) = trimmed.rfind("```") else {
        return trimmed;
    };
    let before = &trimmed[..last_close];
    let Some(open) = before.rfind("```") else {
        return trimmed;
    };
    let block = &before[open + 3..];
    // First line of a fence may carry a language tag.
    match block.split_once('\n') {
        Some((tag, rest)) if !tag.contains('(') => rest.trim(),
        _ => block.trim(),
    }
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), ParseError> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(ParseError::at(
                self.pos - 1,
                format!("expected '{}' but found '{}'", want, c),
            )),
            None => Err(ParseError::at(
                self.pos,
                format!("expected '{}' but reached end of input", want),
            )),
        }
    }

    fn parse_ident(&mut self) -> Option<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_alphabetic() || c == '_' => {}
            _ => return None,
        }
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_' || c == '.') {
            self.pos += 1;
        }
        Some(self.chars[start..self.pos].iter().collect())
    }

    fn parse_call(&mut self) -> Result<ParsedCall, ParseError> {
        self.skip_ws();
        let api_name = self
            .parse_ident()
            .ok_or_else(|| ParseError::at(self.pos, "No API call found!"))?;
        let mut call = ParsedCall {
            api_name,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        };
        self.skip_ws();
        if self.at_end() {
            return Ok(call);
        }
        self.expect('(')?;
        self.skip_ws();
        if self.peek() == Some(')') {
            self.pos += 1;
            return Ok(call);
        }
        loop {
            self.parse_argument(&mut call)?;
            self.skip_ws();
            match self.bump() {
                Some(',') => {
                    self.skip_ws();
                    if self.peek() == Some(')') {
                        self.pos += 1;
                        return Ok(call);
                    }
                }
                Some(')') => return Ok(call),
                Some(c) => {
                    return Err(ParseError::at(
                        self.pos - 1,
                        format!("expected ',' or ')' but found '{}'", c),
                    ))
                }
                None => {
                    return Err(ParseError::at(
                        self.pos,
                        "unterminated argument list",
                    ))
                }
            }
        }
    }

    fn parse_argument(&mut self, call: &mut ParsedCall) -> Result<(), ParseError> {
        self.skip_ws();
        let mark = self.pos;
        if let Some(name) = self.parse_ident() {
            self.skip_ws();
            if self.peek() == Some('=') {
                self.pos += 1;
                let value = self.parse_value()?;
                if call.kwargs.insert(name.clone(), value).is_some() {
                    return Err(ParseError::at(
                        mark,
                        format!("keyword argument '{}' repeated", name),
                    ));
                }
                return Ok(());
            }
            self.pos = mark;
        }
        if !call.kwargs.is_empty() {
            return Err(ParseError::at(
                mark,
                "positional argument follows keyword argument",
            ));
        }
        let value = self.parse_value()?;
        call.args.push(value);
        Ok(())
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        self.skip_ws();
        match self.peek() {
            Some('"') | Some('\'') => self.parse_string().map(Value::String),
            Some('[') => self.parse_list(),
            Some('{') => self.parse_dict(),
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() => self.parse_number(),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let start = self.pos;
                let word = self.parse_ident().unwrap_or_default();
                match word.as_str() {
                    "True" | "true" => Ok(Value::Bool(true)),
                    "False" | "false" => Ok(Value::Bool(false)),
                    "None" | "null" => Ok(Value::Null),
                    _ => Err(ParseError::at(
                        start,
                        format!("unsupported bare name '{}'; quote string arguments", word),
                    )),
                }
            }
            Some(c) => Err(ParseError::at(self.pos, format!("unexpected '{}'", c))),
            None => Err(ParseError::at(self.pos, "expected a value")),
        }
    }

    fn parse_string(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let quote = self.bump().unwrap_or('"');
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some(c) => out.push(c),
                    None => break,
                },
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(ParseError::at(start, "unterminated string literal"))
    }

    fn parse_number(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '_'))
        {
            self.pos += 1;
        }
        let raw: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        let raw = raw.trim_start_matches('+');
        if let Ok(n) = raw.parse::<i64>() {
            return Ok(Value::Number(n.into()));
        }
        raw.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| ParseError::at(start, format!("invalid number '{}'", raw)))
    }

    fn parse_list(&mut self) -> Result<Value, ParseError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                self.pos += 1;
                return Ok(Value::Array(items));
            }
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(']') => return Ok(Value::Array(items)),
                _ => return Err(ParseError::at(self.pos, "unterminated list literal")),
            }
        }
    }

    fn parse_dict(&mut self) -> Result<Value, ParseError> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.pos += 1;
                return Ok(Value::Object(map));
            }
            let key = match self.peek() {
                Some('"') | Some('\'') => self.parse_string()?,
                _ => return Err(ParseError::at(self.pos, "dict keys must be strings")),
            };
            self.expect(':')?;
            let value = self.parse_value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Value::Object(map)),
                _ => return Err(ParseError::at(self.pos, "unterminated dict literal")),
            }
        }
    }
}
