//! Read-only JSONPath queries over `serde_json` values.
//!
//! Supported: `$`, `.name`, `['name']`, `[0]`, `[-1]`, `[*]`, `.*`,
//! `..name`, `..*`, unions (`['a','b']`, `[0,2]`) and slices
//! (`[start:end:step]`). Filter (`?()`) and script (`()`) expressions are
//! rejected, so a query can never run guest-supplied code.

use serde_json::Value;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid JSONPath at offset {offset}: {reason}")]
pub struct JsonPathError {
    pub offset: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Selector {
    Name(String),
    Wildcard,
    Index(i64),
    Slice(Option<i64>, Option<i64>, Option<i64>),
}

#[derive(Debug, Clone, PartialEq)]
struct Segment {
    descendant: bool,
    selectors: Vec<Selector>,
}

/// Evaluates `path` against `root`, returning matches in document order.
pub fn query(path: &str, root: &Value) -> Result<Vec<Value>, JsonPathError> {
    let segments = Parser::new(path).parse()?;

    let mut nodes = vec![root];
    for segment in &segments {
        let mut next = Vec::new();
        for node in nodes {
            if segment.descendant {
                let mut all = Vec::new();
                collect_descendants(node, &mut all);
                for n in all {
                    select(n, &segment.selectors, &mut next);
                }
            } else {
                select(node, &segment.selectors, &mut next);
            }
        }
        nodes = next;
    }

    Ok(nodes.into_iter().cloned().collect())
}

fn collect_descendants<'a>(node: &'a Value, out: &mut Vec<&'a Value>) {
    out.push(node);
    match node {
        Value::Array(items) => items.iter().for_each(|v| collect_descendants(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_descendants(v, out)),
        _ => {}
    }
}

fn select<'a>(node: &'a Value, selectors: &[Selector], out: &mut Vec<&'a Value>) {
    for selector in selectors {
        match (selector, node) {
            (Selector::Name(name), Value::Object(map)) => out.extend(map.get(name)),
            (Selector::Wildcard, Value::Object(map)) => out.extend(map.values()),
            (Selector::Wildcard, Value::Array(items)) => out.extend(items.iter()),
            (Selector::Index(i), Value::Array(items)) => {
                out.extend(normalize_index(*i, items.len()).and_then(|i| items.get(i)))
            }
            (Selector::Slice(start, end, step), Value::Array(items)) => {
                slice_indices(*start, *end, *step, items.len())
                    .into_iter()
                    .for_each(|i| out.push(&items[i]));
            }
            _ => {}
        }
    }
}

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if i < 0 { len + i } else { i };
    (0..len).contains(&i).then_some(i as usize)
}

/// Python-style slice bounds.
fn slice_indices(start: Option<i64>, end: Option<i64>, step: Option<i64>, len: usize) -> Vec<usize> {
    let len = len as i64;
    let step = step.unwrap_or(1);
    if step == 0 || len == 0 {
        return Vec::new();
    }

    let clamp = |v: i64, lo: i64, hi: i64| {
        let v = if v < 0 { v + len } else { v };
        v.clamp(lo, hi)
    };

    let mut out = Vec::new();
    if step > 0 {
        let mut i = start.map_or(0, |s| clamp(s, 0, len));
        let stop = end.map_or(len, |e| clamp(e, 0, len));
        while i < stop {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    } else {
        let mut i = start.map_or(len - 1, |s| clamp(s, -1, len - 1));
        let stop = end.map_or(-1, |e| clamp(e, -1, len - 1));
        while i > stop {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    }
    out
}

struct Parser<'p> {
    src: &'p str,
    pos: usize,
}

impl<'p> Parser<'p> {
    fn new(src: &'p str) -> Self {
        Self { src: src.trim(), pos: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> JsonPathError {
        JsonPathError {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.src[self.pos..].starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn parse(mut self) -> Result<Vec<Segment>, JsonPathError> {
        if !self.eat("$") {
            return Err(self.error("path must start with '$'"));
        }

        let mut segments = Vec::new();
        while self.pos < self.src.len() {
            let descendant = self.eat("..");
            if !descendant && !self.eat(".") && self.peek() != Some('[') {
                return Err(self.error("expected '.', '..' or '['"));
            }

            let selectors = match self.peek() {
                Some('[') => self.bracket()?,
                Some('*') => {
                    self.pos += 1;
                    vec![Selector::Wildcard]
                }
                _ => vec![Selector::Name(self.identifier()?)],
            };
            segments.push(Segment {
                descendant,
                selectors,
            });
        }
        Ok(segments)
    }

    fn identifier(&mut self) -> Result<String, JsonPathError> {
        let rest = &self.src[self.pos..];
        let len = rest
            .find(|c: char| c == '.' || c == '[' || c.is_whitespace())
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("expected a member name"));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn bracket(&mut self) -> Result<Vec<Selector>, JsonPathError> {
        self.eat("[");
        let mut selectors = Vec::new();
        loop {
            self.skip_ws();
            selectors.push(self.selector()?);
            self.skip_ws();
            if self.eat(",") {
                continue;
            }
            if self.eat("]") {
                return Ok(selectors);
            }
            return Err(self.error("expected ',' or ']'"));
        }
    }

    fn selector(&mut self) -> Result<Selector, JsonPathError> {
        match self.peek() {
            Some('*') => {
                self.pos += 1;
                Ok(Selector::Wildcard)
            }
            Some(q @ ('\'' | '"')) => self.quoted(q).map(Selector::Name),
            Some('?') | Some('(') => Err(self.error("filter and script expressions are not supported")),
            Some(_) => self.index_or_slice(),
            None => Err(self.error("unterminated '['")),
        }
    }

    fn quoted(&mut self, quote: char) -> Result<String, JsonPathError> {
        self.pos += 1;
        let mut out = String::new();
        let mut chars = self.src[self.pos..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                    }
                }
                c if c == quote => {
                    self.pos += i + 1;
                    return Ok(out);
                }
                c => out.push(c),
            }
        }
        Err(self.error("unterminated string"))
    }

    fn integer(&mut self) -> Result<Option<i64>, JsonPathError> {
        self.skip_ws();
        let rest = &self.src[self.pos..];
        let len = rest
            .char_indices()
            .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
            .count();
        if len == 0 {
            return Ok(None);
        }
        let n = rest[..len]
            .parse::<i64>()
            .map_err(|_| self.error(format!("invalid integer '{}'", &rest[..len])))?;
        self.pos += len;
        self.skip_ws();
        Ok(Some(n))
    }

    fn index_or_slice(&mut self) -> Result<Selector, JsonPathError> {
        let start = self.integer()?;
        if !self.eat(":") {
            return start
                .map(Selector::Index)
                .ok_or_else(|| self.error("expected an index, name or '*'"));
        }
        let end = self.integer()?;
        let step = if self.eat(":") { self.integer()? } else { None };
        Ok(Selector::Slice(start, end, step))
    }
}
