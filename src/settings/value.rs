//! Permissive literal values of the settings file.
//!
//! A value may encode a literal: `None`, `True`/`False`, numbers, quoted
//! strings, `[...]`/`(...)` lists and `{...}` dicts. Anything that isn't a
//! complete literal is kept as plain text, so `localhost`,
//! `/opt/1cv8/x86_64` or `0000-01-00` stay strings.

use serde_json::{Map, Number, Value};

/// Parses a raw settings value.
pub fn parse_value(raw: &str) -> Value {
    let text = raw.trim();
    let mut literal = Literal::new(text);
    match literal.value() {
        Some(value) if literal.at_end() => value,
        _ => Value::String(text.to_string()),
    }
}

/// Renders a value for the settings file.
///
/// Top-level strings are written verbatim unless they would be read back
/// as another literal, everything else in literal syntax.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) if parse_value(s) == *value => s.clone(),
        other => repr(other),
    }
}

fn repr(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            let escaped = s
                .replace('\\', "\\\\")
                .replace('\'', "\\'")
                .replace('\n', "\\n")
                .replace('\t', "\\t");
            format!("'{escaped}'")
        }
        Value::Array(items) => {
            let items: Vec<_> = items.iter().map(repr).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let items: Vec<_> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", repr(&Value::String(k.clone())), repr(v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
    }
}

struct Literal<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Literal<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.rest().is_empty()
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            '\'' | '"' => self.string().map(Value::String),
            '[' => {
                self.bump();
                self.sequence(']').map(Value::Array)
            }
            '(' => {
                self.bump();
                self.tuple()
            }
            '{' => {
                self.bump();
                self.dict()
            }
            c if c == '-' || c == '+' || c.is_ascii_digit() || c == '.' => self.number(),
            _ => self.keyword(),
        }
    }

    fn keyword(&mut self) -> Option<Value> {
        let word: String = self
            .rest()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        let value = match word.as_str() {
            "None" => Value::Null,
            "True" => Value::Bool(true),
            "False" => Value::Bool(false),
            _ => return None,
        };
        self.pos += word.len();
        Some(value)
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        if matches!(self.peek(), Some('-' | '+')) {
            self.bump();
        }
        let digits_start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        let int_digits = &self.text[digits_start..self.pos];

        let mut float = false;
        if self.peek() == Some('.') {
            float = true;
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            float = true;
            self.bump();
            if matches!(self.peek(), Some('-' | '+')) {
                self.bump();
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }

        let token = &self.text[start..self.pos];
        if float {
            let f: f64 = token.parse().ok()?;
            return Number::from_f64(f).map(Value::Number);
        }

        // leading zeros are only valid for zero itself
        if int_digits.len() > 1 && int_digits.starts_with('0') && int_digits.chars().any(|c| c != '0') {
            return None;
        }
        let i: i64 = token.parse().ok()?;
        Some(Value::Number(i.into()))
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut s = String::new();
        loop {
            match self.bump()? {
                c if c == quote => return Some(s),
                '\\' => match self.bump()? {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    'r' => s.push('\r'),
                    '0' => s.push('\0'),
                    c @ ('\\' | '\'' | '"') => s.push(c),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                },
                c => s.push(c),
            }
        }
    }

    /// Items up to `close`, allowing a trailing comma.
    fn sequence(&mut self, close: char) -> Option<Vec<Value>> {
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Some(items);
            }
            items.push(self.value()?);
            if !self.eat(',') {
                return self.eat(close).then_some(items);
            }
        }
    }

    /// `(x)` is just `x`, `(x,)` and `(x, y)` are lists.
    fn tuple(&mut self) -> Option<Value> {
        if self.eat(')') {
            return Some(Value::Array(Vec::new()));
        }
        let first = self.value()?;
        if self.eat(')') {
            return Some(first);
        }
        if !self.eat(',') {
            return None;
        }
        let mut items = vec![first];
        items.extend(self.sequence(')')?);
        Some(Value::Array(items))
    }

    fn dict(&mut self) -> Option<Value> {
        let mut map = Map::new();
        loop {
            if self.eat('}') {
                return Some(Value::Object(map));
            }
            let key = match self.value()? {
                Value::String(s) => s,
                other => repr(&other),
            };
            if !self.eat(':') {
                return None;
            }
            let value = self.value()?;
            map.insert(key, value);
            if !self.eat(',') {
                return self.eat('}').then_some(Value::Object(map));
            }
        }
    }
}
