//! Statement metering for guest code.
//!
//! QuickJS only calls the interrupt hook once per large batch of
//! operations, which says nothing about how many statements ran. Before a
//! run the guest source is rewritten so that a hidden counter function is
//! called on entry to every block, after every `;`-terminated statement in
//! a statement list, and on every test of a `while`, `do … while` or
//! `for (;;)` loop. The counter throws once the budget is spent and trips
//! the run's [`Governor`], so a guest `catch` cannot resume.
//!
//! The rewrite works on tokens, not on a syntax tree. A `{` that cannot be
//! placed with certainty is treated as an object literal and left alone.

use std::rc::Rc;

use rquickjs::{Ctx, Exception, Function, Object};

use super::Governor;

#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    #[error("unterminated {0}")]
    Unterminated(&'static str),

    #[error("unbalanced '{0}' at byte {1}")]
    Unbalanced(char, usize),
}

/// Per-run names of the counter function and the variable its result is
/// assigned to. Both are random so guest code cannot refer to them.
pub(crate) struct Meter {
    counter: String,
    sink: String,
}

impl Meter {
    pub(crate) fn new() -> Self {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        Self {
            counter: format!("__runjs_step_{tag}"),
            sink: format!("__runjs_step_{tag}_v"),
        }
    }

    /// Defines the counter as a read-only, non-enumerable global.
    pub(crate) fn install<'js>(&self, ctx: &Ctx<'js>, governor: Rc<Governor>) -> rquickjs::Result<()> {
        let counter = Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<bool> {
            if governor.step() {
                Ok(true)
            } else {
                Err(Exception::throw_internal(&ctx, "execution limit reached"))
            }
        })?;
        let globals: Object<'js> = ctx.globals();
        globals.prop(self.counter.as_str(), counter)
    }

    pub(crate) fn instrument(&self, source: &str) -> Result<String, MeterError> {
        let tokens = lex(source)?;
        let significant: Vec<&Token> = tokens.iter().filter(|t| t.kind != Kind::Trivia).collect();

        let statement = format!(" var {} = {}();", self.sink, self.counter);
        let check = format!("{}()", self.counter);

        let mut out = String::with_capacity(source.len() * 2);
        out.push_str(statement.trim_start());

        let mut stack: Vec<Frame> = Vec::new();
        let mut cursor = 0;
        let mut prev: Option<(Kind, &str)> = None;
        let mut loop_head: Option<Loop> = None;
        let mut class_at: Option<usize> = None;
        let mut switch_at: Option<usize> = None;
        let mut case_open = false;
        let mut case_colon = false;

        for (n, token) in significant.iter().enumerate() {
            out.push_str(&source[cursor..token.start]);
            cursor = token.end;

            let text = &source[token.start..token.end];
            let next = significant.get(n + 1).map(|t| &source[t.start..t.end]);
            let after_dot = matches!(prev, Some((Kind::Punct, ".")));
            let prev_case_colon = std::mem::take(&mut case_colon);

            if text != "(" && !(text == "await" && loop_head == Some(Loop::For)) {
                loop_head = None;
            }

            match (token.kind, text) {
                (Kind::Word, "for") if !after_dot => loop_head = Some(Loop::For),
                (Kind::Word, "while") if !after_dot => loop_head = Some(Loop::While),
                (Kind::Word, "class") if !after_dot && next != Some(":") => class_at = Some(stack.len()),
                (Kind::Word, "switch") if !after_dot && next == Some("(") => switch_at = Some(stack.len()),
                (Kind::Word, "case" | "default") if !after_dot && stack.last() == Some(&Frame::Switch) => {
                    case_open = true
                }
                _ => {}
            }

            match (token.kind, text) {
                (Kind::Punct, "{") => {
                    let frame = if class_at == Some(stack.len()) {
                        class_at = None;
                        Frame::Class
                    } else if switch_at == Some(stack.len()) {
                        switch_at = None;
                        Frame::Switch
                    } else if opens_block(prev, prev_case_colon, stack.last()) {
                        Frame::Block
                    } else {
                        Frame::Object
                    };
                    out.push('{');
                    if frame == Frame::Block {
                        out.push_str(&statement);
                    }
                    stack.push(frame);
                }
                (Kind::Punct, "}") => match stack.pop() {
                    Some(Frame::Block | Frame::Object | Frame::Class | Frame::Switch) => out.push('}'),
                    _ => return Err(MeterError::Unbalanced('}', token.start)),
                },
                (Kind::Punct, "(") => {
                    let frame = match loop_head.take() {
                        Some(Loop::For) => Frame::ForHead { semis: 0, wrapped: false },
                        Some(Loop::While) => Frame::WhileHead,
                        None => Frame::Group,
                    };
                    out.push('(');
                    if frame == Frame::WhileHead {
                        out.push_str(&check);
                        out.push_str(" && (");
                    }
                    stack.push(frame);
                }
                (Kind::Punct, ")") => match stack.pop() {
                    Some(Frame::Group | Frame::ForHead { .. }) => out.push(')'),
                    Some(Frame::WhileHead) => out.push_str("))"),
                    _ => return Err(MeterError::Unbalanced(')', token.start)),
                },
                (Kind::Punct, "[") => {
                    out.push('[');
                    stack.push(Frame::Index);
                }
                (Kind::Punct, "]") => match stack.pop() {
                    Some(Frame::Index) => out.push(']'),
                    _ => return Err(MeterError::Unbalanced(']', token.start)),
                },
                (Kind::Punct, ";") => match stack.last_mut() {
                    Some(Frame::ForHead { semis, wrapped }) => {
                        match *semis {
                            0 if next == Some(";") => {
                                out.push(';');
                                out.push(' ');
                                out.push_str(&check);
                            }
                            0 => {
                                out.push(';');
                                out.push(' ');
                                out.push_str(&check);
                                out.push_str(" && (");
                                *wrapped = true;
                            }
                            1 if *wrapped => out.push_str(");"),
                            _ => out.push(';'),
                        }
                        *semis = semis.saturating_add(1);
                    }
                    None | Some(Frame::Block | Frame::Switch) => {
                        out.push(';');
                        if !matches!(next, Some("else" | "while" | "catch" | "finally")) {
                            out.push_str(&statement);
                        }
                    }
                    Some(_) => out.push(';'),
                },
                (Kind::Punct, ":") => {
                    if case_open && stack.last() == Some(&Frame::Switch) {
                        case_open = false;
                        case_colon = true;
                    }
                    out.push(':');
                }
                _ => out.push_str(text),
            }

            prev = Some((token.kind, text));
        }
        out.push_str(&source[cursor..]);

        if !stack.is_empty() {
            return Err(MeterError::Unterminated("block"));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loop {
    For,
    While,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Block,
    Object,
    Class,
    Switch,
    Group,
    Index,
    ForHead { semis: u8, wrapped: bool },
    WhileHead,
}

/// Whether a `{` after `prev` starts a statement block.
fn opens_block(prev: Option<(Kind, &str)>, after_case: bool, parent: Option<&Frame>) -> bool {
    match prev {
        None => true,
        Some((Kind::Punct, ")" | ";" | "}" | "=>")) => true,
        Some((Kind::Punct, "{")) => matches!(parent, Some(Frame::Block)),
        Some((Kind::Punct, ":")) => after_case,
        Some((Kind::Word, word)) => matches!(word, "else" | "do" | "try" | "finally" | "catch"),
        _ => false,
    }
}

// ── lexer ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Word,
    Punct,
    Literal,
    Trivia,
}

#[derive(Debug)]
struct Token {
    kind: Kind,
    start: usize,
    end: usize,
}

/// Keywords after which a `/` starts a regular expression.
const REGEX_AFTER: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

fn lex(src: &str) -> Result<Vec<Token>, MeterError> {
    let b = src.as_bytes();
    let mut tokens: Vec<Token> = Vec::new();
    // Brace depth inside each open template substitution
    let mut templates: Vec<usize> = Vec::new();
    let mut i = 0;

    while i < b.len() {
        let start = i;
        let kind = match b[i] {
            c if c.is_ascii_whitespace() || c == 0x0b => {
                while i < b.len() && (b[i].is_ascii_whitespace() || b[i] == 0x0b) {
                    i += 1;
                }
                Kind::Trivia
            }
            b'/' if b.get(i + 1) == Some(&b'/') => {
                while i < b.len() && b[i] != b'\n' {
                    i += 1;
                }
                Kind::Trivia
            }
            b'/' if b.get(i + 1) == Some(&b'*') => {
                i = find(b, i + 2, b"*/").ok_or(MeterError::Unterminated("comment"))? + 2;
                Kind::Trivia
            }
            b'/' if regex_allowed(src, &tokens) => {
                i = scan_regex(b, i)?;
                Kind::Literal
            }
            b'\'' | b'"' => {
                i = scan_string(b, i)?;
                Kind::Literal
            }
            b'`' => {
                i = scan_template(b, i + 1, &mut templates)?;
                Kind::Literal
            }
            b'}' if templates.last() == Some(&0) => {
                templates.pop();
                i = scan_template(b, i + 1, &mut templates)?;
                Kind::Literal
            }
            b'{' => {
                if let Some(depth) = templates.last_mut() {
                    *depth += 1;
                }
                i += 1;
                Kind::Punct
            }
            b'}' => {
                if let Some(depth) = templates.last_mut() {
                    *depth -= 1;
                }
                i += 1;
                Kind::Punct
            }
            b'=' if b.get(i + 1) == Some(&b'>') => {
                i += 2;
                Kind::Punct
            }
            c if is_word_byte(c) => {
                while i < b.len() && is_word_byte(b[i]) {
                    i += 1;
                }
                Kind::Word
            }
            _ => {
                i += 1;
                Kind::Punct
            }
        };
        tokens.push(Token { kind, start, end: i });
    }

    if !templates.is_empty() {
        return Err(MeterError::Unterminated("template literal"));
    }
    Ok(tokens)
}

fn is_word_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c == b'\\' || c >= 0x80
}

fn regex_allowed(src: &str, tokens: &[Token]) -> bool {
    let Some(last) = tokens.iter().rev().find(|t| t.kind != Kind::Trivia) else {
        return true;
    };
    let text = &src[last.start..last.end];
    match last.kind {
        Kind::Punct => text != ")" && text != "]",
        Kind::Word => REGEX_AFTER.contains(&text),
        _ => false,
    }
}

fn find(b: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    b.get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn scan_string(b: &[u8], mut i: usize) -> Result<usize, MeterError> {
    let quote = b[i];
    i += 1;
    while i < b.len() {
        match b[i] {
            b'\\' => i += 2,
            b'\n' => break,
            c if c == quote => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(MeterError::Unterminated("string"))
}

/// Scans template text from `i` up to the closing backtick or the next
/// `${`, which opens a substitution.
fn scan_template(b: &[u8], mut i: usize, templates: &mut Vec<usize>) -> Result<usize, MeterError> {
    while i < b.len() {
        match b[i] {
            b'\\' => i += 2,
            b'`' => return Ok(i + 1),
            b'$' if b.get(i + 1) == Some(&b'{') => {
                templates.push(0);
                return Ok(i + 2);
            }
            _ => i += 1,
        }
    }
    Err(MeterError::Unterminated("template literal"))
}

fn scan_regex(b: &[u8], mut i: usize) -> Result<usize, MeterError> {
    i += 1;
    let mut in_class = false;
    loop {
        match b.get(i) {
            None | Some(b'\n') => return Err(MeterError::Unterminated("regular expression")),
            Some(b'\\') => i += 2,
            Some(b'[') => {
                in_class = true;
                i += 1;
            }
            Some(b']') => {
                in_class = false;
                i += 1;
            }
            Some(b'/') if !in_class => {
                i += 1;
                break;
            }
            Some(_) => i += 1,
        }
    }
    while i < b.len() && is_word_byte(b[i]) {
        i += 1;
    }
    Ok(i)
}
