#![allow(dead_code)]

use std::iter::Peekable;
use std::str::Chars;

use cinder_core::collections::{PersistentMap, PersistentSet};
use cinder_core::symbols::{line_key, Keyword};
use cinder_core::{CinderError, CompileOptions, Compiler, Value};

/// Minimal s-expression reader for tests. Lists carry `:line` metadata.
struct Reader<'a> {
    chars: Peekable<Chars<'a>>,
    line: u32,
}

impl<'a> Reader<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
            line: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_blank(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == ';' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else if c.is_whitespace() || c == ',' {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn read(&mut self) -> Option<Value> {
        self.skip_blank();
        let line = self.line;
        let c = self.bump()?;
        Some(match c {
            '(' => {
                let list = Value::list(self.read_until(')'));
                let meta = PersistentMap::new().assoc(Value::Keyword(line_key()), Value::Int(line as i64));
                list.with_meta(Some(meta)).expect("lists hold metadata")
            }
            '[' => Value::vector(self.read_until(']')),
            '{' => {
                let items = self.read_until('}');
                Value::Map(PersistentMap::from_pairs(
                    items.chunks(2).map(|kv| (kv[0].clone(), kv[1].clone())),
                ))
            }
            '#' => {
                assert_eq!(self.bump(), Some('{'), "only #{{ is supported after #");
                Value::Set(PersistentSet::from_vec(self.read_until('}')))
            }
            '\'' => {
                let quoted = self.read().expect("form after quote");
                Value::list(vec![Value::symbol("quote"), quoted])
            }
            '"' => self.read_string(),
            other => self.read_atom(other),
        })
    }

    fn read_until(&mut self, close: char) -> Vec<Value> {
        let mut items = Vec::new();
        loop {
            self.skip_blank();
            match self.chars.peek() {
                Some(&c) if c == close => {
                    self.bump();
                    return items;
                }
                Some(_) => items.push(self.read().expect("form")),
                None => panic!("unterminated collection, expected {}", close),
            }
        }
    }

    fn read_string(&mut self) -> Value {
        let mut text = String::new();
        loop {
            match self.bump().expect("unterminated string") {
                '"' => return Value::string(text),
                '\\' => match self.bump().expect("escape") {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    other => text.push(other),
                },
                other => text.push(other),
            }
        }
    }

    fn read_atom(&mut self, first: char) -> Value {
        let mut token = first.to_string();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || "()[]{}\",;".contains(c) {
                break;
            }
            token.push(c);
            self.bump();
        }
        match token.as_str() {
            "nil" => return Value::Nil,
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Some(kw) = token.strip_prefix(':') {
            return Value::Keyword(match kw.rsplit_once('/') {
                Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Keyword::intern(Some(ns), name),
                _ => Keyword::intern(None, kw),
            });
        }
        if let Ok(n) = token.parse::<i64>() {
            return Value::Int(n);
        }
        if token.contains('.') {
            if let Ok(f) = token.parse::<f64>() {
                return Value::Float(f);
            }
        }
        Value::symbol(&token)
    }
}

pub fn read_all(src: &str) -> Vec<Value> {
    let mut reader = Reader::new(src);
    let mut forms = Vec::new();
    while let Some(form) = reader.read() {
        forms.push(form);
    }
    forms
}

pub fn read_one(src: &str) -> Value {
    read_all(src).into_iter().next().expect("one form")
}

/// Compiler whose current namespace is `ns`, so parallel tests do not share
/// definitions.
pub fn compiler(ns: &str) -> Compiler {
    cinder_core::logging::init_with_level(None);
    Compiler::with_options(CompileOptions {
        default_ns: ns.to_string(),
        ..CompileOptions::default()
    })
}

/// Evaluates every form of `src` in `ns`, returning the last value.
pub fn eval_in(ns: &str, src: &str) -> Result<Value, CinderError> {
    let mut compiler = compiler(ns);
    let mut last = Value::Nil;
    for form in read_all(src) {
        last = compiler.eval(&form)?;
    }
    Ok(last)
}
