//! Spintax parsing and expansion.
//!
//! Grammar:
//!
//! ```text
//! sequence := (literal | variable | choice)*
//! choice   := '{' sequence ('|' sequence)* '}'
//! variable := '{{' ws* [A-Za-z0-9_]+ ws* '}}'
//! ```
//!
//! Variables are recognized before choices, so `{{first_name}}` is never
//! mistaken for a nested group. There is no escape syntax: a literal `{` or
//! `}` cannot appear in template text.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::TemplateError;

/// One parsed template element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Literal(String),
    /// `{{name}}`; `raw` keeps the original text for unknown tokens
    Variable { name: String, raw: String },
    /// `{a|b|c}`, always at least one alternative
    Choice(Vec<Vec<Node>>),
}

/// Source of choice-group selections: `count -> index in 0..count`.
pub trait Chooser {
    fn choose(&mut self, count: usize) -> usize;
}

/// Uniform random selection.
pub struct RandomChooser<R = StdRng> {
    rng: R,
}

impl RandomChooser<StdRng> {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl<R: Rng> RandomChooser<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: Rng> Chooser for RandomChooser<R> {
    fn choose(&mut self, count: usize) -> usize {
        self.rng.gen_range(0..count)
    }
}

/// Adapter turning a closure into a [`Chooser`].
pub struct FnChooser<F>(pub F);

impl<F: FnMut(usize) -> usize> Chooser for FnChooser<F> {
    fn choose(&mut self, count: usize) -> usize {
        (self.0)(count)
    }
}

/// Parse a template fragment. `part` names it in error messages.
pub fn parse(src: &str, part: &'static str) -> Result<Vec<Node>, TemplateError> {
    let mut parser = Parser { src, pos: 0, part };
    parser.sequence(false)
}

/// Expand `nodes` into `out`, resolving variables through `lookup`.
pub fn expand<'v>(
    nodes: &[Node],
    lookup: &dyn Fn(&str) -> Option<&'v str>,
    chooser: &mut dyn Chooser,
    out: &mut String,
) {
    for node in nodes {
        match node {
            Node::Literal(text) => out.push_str(text),
            Node::Variable { name, raw } => match lookup(name) {
                Some(value) => out.push_str(value),
                None => out.push_str(raw),
            },
            Node::Choice(alternatives) => {
                let picked = chooser.choose(alternatives.len()).min(alternatives.len() - 1);
                expand(&alternatives[picked], lookup, chooser, out);
            }
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    part: &'static str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    /// Parse until end of input, or until an unconsumed `|`/`}` when inside a choice.
    fn sequence(&mut self, in_choice: bool) -> Result<Vec<Node>, TemplateError> {
        let mut nodes = Vec::new();
        let mut literal = String::new();

        while let Some(c) = self.peek() {
            match c {
                '{' => {
                    flush(&mut literal, &mut nodes);
                    if let Some(variable) = self.variable() {
                        nodes.push(variable);
                    } else {
                        let open = self.pos;
                        self.pos += 1;
                        nodes.push(Node::Choice(self.choice(open)?));
                    }
                }
                '}' | '|' if in_choice => break,
                '}' => {
                    return Err(TemplateError::UnopenedChoice {
                        part: self.part,
                        offset: self.pos,
                    })
                }
                _ => {
                    literal.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }

        flush(&mut literal, &mut nodes);
        Ok(nodes)
    }

    /// Alternatives of a group whose `{` sits at `open` and has been consumed.
    fn choice(&mut self, open: usize) -> Result<Vec<Vec<Node>>, TemplateError> {
        let mut alternatives = Vec::new();
        loop {
            alternatives.push(self.sequence(true)?);
            match self.peek() {
                Some('}') => {
                    self.pos += 1;
                    return Ok(alternatives);
                }
                Some(_) => self.pos += 1,
                None => {
                    return Err(TemplateError::UnclosedChoice {
                        part: self.part,
                        offset: open,
                    })
                }
            }
        }
    }

    /// Consume a `{{name}}` token at the cursor, if there is one.
    fn variable(&mut self) -> Option<Node> {
        let rest = &self.src[self.pos..];
        let inner = rest.strip_prefix("{{")?;
        let close = inner.find("}}")?;
        let name = inner[..close].trim();

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }

        let len = 2 + close + 2;
        let node = Node::Variable {
            name: name.to_string(),
            raw: rest[..len].to_string(),
        };
        self.pos += len;
        Some(node)
    }
}

fn flush(literal: &mut String, nodes: &mut Vec<Node>) {
    if !literal.is_empty() {
        nodes.push(Node::Literal(std::mem::take(literal)));
    }
}
