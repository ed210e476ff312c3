//! Choice Trace Files
//!
//! Line oriented text that pins down one path through the state space:
//!
//! ```text
//! /* optional comment */
//! application: racy-counter
//! [0] ThreadChoiceFromSet 0
//! [1] #0 1                     ← "#0" = first class name introduced
//! [2] BooleanChoiceGenerator 1  // verbose: generator description
//! [3] #1 0
//! ```
//!
//! Every distinct generator type is spelled out once and referenced as `#n`
//! afterwards, numbered in order of first appearance. `//` and `/* */`
//! comments are ignored by the reader.

use crate::domain::error::TraceError;
use crate::domain::transition::{ChoicePoint, SystemState};
use rustc_hash::FxHashMap;
use std::fmt::Write as _;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A stored path: application name plus one choice per generator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFile {
    /// Value of the `application:` header
    pub application: String,
    /// Free text written as a leading block comment
    pub comment: Option<String>,
    /// Choices, oldest first
    pub points: Vec<ChoicePoint>,
    /// Generator descriptions written in verbose mode, parallel to `points`
    pub notes: Vec<String>,
}

impl TraceFile {
    /// Trace of `points` for `application`
    pub fn new(application: impl Into<String>, points: Vec<ChoicePoint>) -> Self {
        Self {
            application: application.into(),
            comment: None,
            points,
            notes: Vec::new(),
        }
    }

    /// Current choice path of `system`, with generator descriptions
    pub fn from_system(application: impl Into<String>, system: &SystemState) -> Self {
        let mut trace = Self::new(application, Vec::new());
        for h in system.choice_generators() {
            let Some(cg) = system.cg(h) else { continue };
            if let Some(point) = ChoicePoint::of(cg) {
                trace.points.push(point);
                trace.notes.push(cg.to_string());
            }
        }
        trace
    }

    /// Attach a leading comment
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Number of recorded choices
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// No choices recorded
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Writing
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Render to text; `verbose` appends the generator description
    pub fn render(&self, verbose: bool) -> String {
        let mut out = String::new();
        if let Some(comment) = &self.comment {
            let _ = writeln!(out, "/* {comment} */");
        }
        let _ = writeln!(out, "application: {}", self.application);

        let mut ids: FxHashMap<&str, usize> = FxHashMap::default();
        for (i, point) in self.points.iter().enumerate() {
            let _ = write!(out, "[{i}] ");
            let next_id = ids.len();
            match ids.get(&*point.cg_type) {
                Some(id) => {
                    let _ = write!(out, "#{id}");
                }
                None => {
                    ids.insert(&point.cg_type, next_id);
                    out.push_str(&point.cg_type);
                }
            }
            let _ = write!(out, " {}", point.choice);
            if verbose {
                if let Some(note) = self.notes.get(i) {
                    let _ = write!(out, "  // {note}");
                }
            }
            out.push('\n');
        }
        out
    }

    /// Write to `path`, replacing any existing file
    pub fn store(&self, path: impl AsRef<Path>, verbose: bool) -> Result<(), TraceError> {
        let path = path.as_ref();
        let mut w = BufWriter::new(std::fs::File::create(path)?);
        w.write_all(self.render(verbose).as_bytes())?;
        w.flush()?;
        debug!(path = %path.display(), choices = self.len(), "trace stored");
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Reading
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Parse trace text. With `application` set, the header must match it.
    pub fn parse(text: &str, application: Option<&str>) -> Result<Self, TraceError> {
        let stripped = strip_comments(text);
        let mut scanner = Scanner::new(&stripped);

        scanner.expect_word("application:")?;
        let found = scanner.word()?;
        if let Some(expected) = application {
            if expected != found {
                return Err(TraceError::ApplicationMismatch {
                    expected: expected.to_string(),
                    found: found.to_string(),
                });
            }
        }

        let mut classes: Vec<Arc<str>> = Vec::new();
        let mut points = Vec::new();
        while !scanner.at_end() {
            scanner.expect_char('[')?;
            scanner.number()?;
            scanner.expect_char(']')?;
            let name = scanner.word()?;
            let cg_type = if let Some(id) = name.strip_prefix('#') {
                id.parse::<usize>()
                    .ok()
                    .and_then(|id| classes.get(id).cloned())
                    .ok_or_else(|| TraceError::UnknownClassId(name.to_string()))?
            } else {
                let cls: Arc<str> = Arc::from(name);
                classes.push(Arc::clone(&cls));
                cls
            };
            let choice = scanner.number()?;
            points.push(ChoicePoint { cg_type, choice });
        }

        Ok(Self::new(found, points))
    }

    /// Read and parse a trace file
    pub fn read(path: impl AsRef<Path>, application: Option<&str>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let trace = Self::parse(&text, application)?;
        debug!(path = %path.display(), choices = trace.len(), "trace read");
        Ok(trace)
    }
}

/// Drop `// ...` line comments and `/* ... */` block comments
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let line = rest.find("//");
        let block = rest.find("/*");
        match (line, block) {
            (Some(l), b) if b.map_or(true, |b| l < b) => {
                out.push_str(&rest[..l]);
                let tail = &rest[l..];
                rest = tail.find('\n').map_or("", |nl| &tail[nl..]);
            }
            (_, Some(b)) => {
                out.push_str(&rest[..b]);
                out.push(' ');
                let tail = &rest[b + 2..];
                rest = tail.find("*/").map_or("", |end| &tail[end + 2..]);
            }
            _ => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Word(&'a str),
    Char(char),
}

struct Scanner<'a> {
    tokens: std::iter::Peekable<std::vec::IntoIter<Token<'a>>>,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        let mut tokens = Vec::new();
        let mut start = None;
        for (i, c) in text.char_indices() {
            let separator = c.is_whitespace() || c == '[' || c == ']';
            if separator {
                if let Some(s) = start.take() {
                    tokens.push(Token::Word(&text[s..i]));
                }
                if !c.is_whitespace() {
                    tokens.push(Token::Char(c));
                }
            } else if start.is_none() {
                start = Some(i);
            }
        }
        if let Some(s) = start {
            tokens.push(Token::Word(&text[s..]));
        }
        Self {
            tokens: tokens.into_iter().peekable(),
        }
    }

    fn at_end(&mut self) -> bool {
        self.tokens.peek().is_none()
    }

    fn next_described(&mut self) -> (Option<Token<'a>>, String) {
        let token = self.tokens.next();
        let found = match token {
            Some(Token::Word(w)) => w.to_string(),
            Some(Token::Char(c)) => c.to_string(),
            None => "EOF".to_string(),
        };
        (token, found)
    }

    fn expect_word(&mut self, word: &str) -> Result<(), TraceError> {
        match self.next_described() {
            (Some(Token::Word(w)), _) if w == word => Ok(()),
            (_, found) => Err(TraceError::Expected {
                expected: word.to_string(),
                found,
            }),
        }
    }

    fn expect_char(&mut self, c: char) -> Result<(), TraceError> {
        match self.next_described() {
            (Some(Token::Char(t)), _) if t == c => Ok(()),
            (_, found) => Err(TraceError::Expected {
                expected: format!("char '{c}'"),
                found,
            }),
        }
    }

    fn word(&mut self) -> Result<&'a str, TraceError> {
        match self.next_described() {
            (Some(Token::Word(w)), _) => Ok(w),
            (_, found) => Err(TraceError::Expected {
                expected: "word".to_string(),
                found,
            }),
        }
    }

    fn number(&mut self) -> Result<usize, TraceError> {
        match self.next_described() {
            (Some(Token::Word(w)), found) => w.parse().map_err(|_| TraceError::Expected {
                expected: "number".to_string(),
                found,
            }),
            (_, found) => Err(TraceError::Expected {
                expected: "number".to_string(),
                found,
            }),
        }
    }
}
