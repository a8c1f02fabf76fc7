pub mod tokens;

use std::fmt::{self, Display};
use std::iter::Peekable;
use std::str::CharIndices;

pub use tokens::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexerError {
    UnterminatedString,
    UnexpectedChar(char),
}

impl Display for LexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexerError::UnterminatedString => write!(f, "unterminated quoted scalar"),
            LexerError::UnexpectedChar(c) => write!(f, "unexpected character '{c}'"),
        }
    }
}

impl std::error::Error for LexerError {}

const STOP_CHARS: &[char] = &[':', ',', '#', '\n', '{', '}', '[', ']', '"', '\''];

pub struct Tokenizer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
    at_line_start: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            at_line_start: true,
        }
    }

    /// Drives a flat-ish, indentation-sensitive tokenizer: at the start of
    /// every line it emits exactly one `Indent(n)` before anything else on
    /// that line, mirroring what `Parser::parse_map`/`parse_list` expect to
    /// see for nesting decisions.
    pub fn next_token(&mut self) -> Result<Token<'a>, LexerError> {
        if self.at_line_start {
            self.skip_blank_lines();
            self.at_line_start = false;
            let indent = self.count_indent();
            return Ok(Token::Indent(indent));
        }

        self.skip_inline_spaces();

        let Some(&(start, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };

        match ch {
            '\n' => {
                self.chars.next();
                self.at_line_start = true;
                Ok(Token::NewLine)
            }
            '-' => {
                self.chars.next();
                Ok(Token::Dash)
            }
            ',' => {
                self.chars.next();
                Ok(Token::Comma)
            }
            ':' => {
                self.chars.next();
                Ok(Token::Colon)
            }
            '#' => {
                self.skip_to_eol();
                self.next_token()
            }
            '{' => {
                self.chars.next();
                Ok(Token::OpenBrace)
            }
            '}' => {
                self.chars.next();
                Ok(Token::CloseBrace)
            }
            '[' => {
                self.chars.next();
                Ok(Token::OpenBracket)
            }
            ']' => {
                self.chars.next();
                Ok(Token::CloseBracket)
            }
            '"' | '\'' => self.read_quoted(ch),
            _ => Ok(self.read_identifier(start)),
        }
    }

    fn skip_inline_spaces(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch == ' ' || ch == '\t' {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    /// Consume any lines that are empty or whitespace-only so they never
    /// produce a spurious `Indent`/`NewLine` pair the map/list parsers would
    /// have to special-case.
    fn skip_blank_lines(&mut self) {
        loop {
            let mut probe = self.chars.clone();
            let mut saw_content = false;
            let mut consumed = 0usize;
            for (_, ch) in probe.by_ref() {
                consumed += 1;
                if ch == '\n' {
                    break;
                }
                if ch == '#' {
                    break;
                }
                if ch != ' ' && ch != '\t' {
                    saw_content = true;
                    break;
                }
            }
            if saw_content || consumed == 0 {
                return;
            }
            for _ in 0..consumed {
                self.chars.next();
            }
        }
    }

    fn skip_to_eol(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch == '\n' {
                break;
            }
            self.chars.next();
        }
    }

    fn count_indent(&mut self) -> usize {
        let mut n = 0;
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch == ' ' {
                self.chars.next();
                n += 1;
            } else {
                break;
            }
        }
        n
    }

    fn read_identifier(&mut self, start: usize) -> Token<'a> {
        let mut end = start;
        while let Some(&(i, ch)) = self.chars.peek() {
            if ch.is_whitespace() || STOP_CHARS.contains(&ch) {
                end = i;
                break;
            }
            self.chars.next();
            end = i + ch.len_utf8();
        }
        Token::Identifier(&self.source[start..end])
    }

    fn read_quoted(&mut self, quote: char) -> Result<Token<'a>, LexerError> {
        self.chars.next(); // opening quote
        let Some(&(start, _)) = self.chars.peek() else {
            return Err(LexerError::UnterminatedString);
        };
        let mut end = start;
        loop {
            match self.chars.peek() {
                Some(&(i, ch)) if ch == quote => {
                    end = i;
                    self.chars.next();
                    break;
                }
                Some(&(i, ch)) => {
                    self.chars.next();
                    end = i + ch.len_utf8();
                }
                None => return Err(LexerError::UnterminatedString),
            }
        }
        Ok(Token::Scalar(&self.source[start..end]))
    }
}
