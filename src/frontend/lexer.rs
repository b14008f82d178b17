//! Lexer for the UDO source subset
//!
//! Produces a flat token stream. Preprocessor lines are skipped wholesale:
//! the runtime header is injected by the analyzer, so `#include` directives
//! in user code carry no information.

use crate::error::{UdoError, UdoResult};

use super::token::{SourceLoc, Token, TokenWithLoc};

pub struct Lexer<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer {
            input,
            bytes: input.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.line, self.col)
    }

    fn current(&self) -> Option<char> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let byte = self.bytes[self.pos];
        if byte < 128 {
            Some(byte as char)
        } else {
            self.input[self.pos..].chars().next()
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        let byte_pos = self.pos + offset;
        if byte_pos >= self.bytes.len() {
            return None;
        }
        let byte = self.bytes[byte_pos];
        if byte < 128 {
            Some(byte as char)
        } else {
            self.input[byte_pos..].chars().next()
        }
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.current();
        if let Some(ch) = c {
            if ch == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            self.pos += ch.len_utf8();
        }
        c
    }

    fn error(&self, message: impl Into<String>) -> UdoError {
        UdoError::invalid_user_code(format!("{} at {}", message.into(), self.loc()))
    }

    fn skip_trivia(&mut self) -> UdoResult<()> {
        loop {
            match self.current() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek(1) == Some('/') => {
                    while let Some(c) = self.advance() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek(1) == Some('*') => {
                    self.advance();
                    self.advance();
                    loop {
                        match self.current() {
                            Some('*') if self.peek(1) == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                            None => return Err(self.error("unterminated block comment")),
                        }
                    }
                }
                // Preprocessor line, including continuations
                Some('#') => loop {
                    match self.advance() {
                        Some('\\') if self.current() == Some('\n') => {
                            self.advance();
                        }
                        Some('\n') | None => break,
                        Some(_) => {}
                    }
                },
                _ => return Ok(()),
            }
        }
    }

    fn read_escape(&mut self) -> UdoResult<u8> {
        match self.advance() {
            Some('n') => Ok(b'\n'),
            Some('t') => Ok(b'\t'),
            Some('r') => Ok(b'\r'),
            Some('0') => Ok(0),
            Some('\\') => Ok(b'\\'),
            Some('\'') => Ok(b'\''),
            Some('"') => Ok(b'"'),
            Some(c) => Err(self.error(format!("unsupported escape sequence \\{}", c))),
            None => Err(self.error("unterminated escape sequence")),
        }
    }

    fn read_string(&mut self) -> UdoResult<Token> {
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return Ok(Token::StrLit(value));
                }
                Some('\\') => {
                    self.advance();
                    value.push(self.read_escape()? as char);
                }
                Some(c) => {
                    self.advance();
                    value.push(c);
                }
                None => return Err(self.error("unterminated string literal")),
            }
        }
    }

    fn read_char(&mut self) -> UdoResult<Token> {
        self.advance(); // opening quote
        let value = match self.current() {
            Some('\\') => {
                self.advance();
                self.read_escape()?
            }
            Some(c) if c.is_ascii() => {
                self.advance();
                c as u8
            }
            Some(_) => return Err(self.error("non-ascii character literal")),
            None => return Err(self.error("unterminated character literal")),
        };
        if self.current() != Some('\'') {
            return Err(self.error("unterminated character literal"));
        }
        self.advance();
        Ok(Token::CharLit(value))
    }

    fn read_number(&mut self) -> UdoResult<Token> {
        let start = self.pos;

        if self.current() == Some('0') && matches!(self.peek(1), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            let digits_start = self.pos;
            while matches!(self.current(), Some(c) if c.is_ascii_hexdigit()) {
                self.advance();
            }
            let digits = &self.input[digits_start..self.pos];
            if digits.is_empty() {
                return Err(self.error("invalid hexadecimal literal"));
            }
            self.skip_int_suffix();
            let value = u64::from_str_radix(digits, 16)
                .map_err(|_| self.error("integer literal out of range"))?;
            return Ok(Token::IntLit(value));
        }

        while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }

        let mut is_float = false;
        if self.current() == Some('.') && matches!(self.peek(1), Some(c) if c.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.current(), Some('e') | Some('E'))
            && matches!(self.peek(1), Some(c) if c.is_ascii_digit() || c == '+' || c == '-')
        {
            is_float = true;
            self.advance();
            if matches!(self.current(), Some('+') | Some('-')) {
                self.advance();
            }
            while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }

        let text = &self.input[start..self.pos];
        if is_float {
            let is_f32 = matches!(self.current(), Some('f') | Some('F'));
            if is_f32 {
                self.advance();
            }
            let value: f64 = text
                .parse()
                .map_err(|_| self.error("invalid floating-point literal"))?;
            Ok(Token::FloatLit { value, is_f32 })
        } else {
            self.skip_int_suffix();
            let value: u64 = text
                .parse()
                .map_err(|_| self.error("integer literal out of range"))?;
            Ok(Token::IntLit(value))
        }
    }

    fn skip_int_suffix(&mut self) {
        while matches!(self.current(), Some('u') | Some('U') | Some('l') | Some('L')) {
            self.advance();
        }
    }

    fn read_ident(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.current(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.advance();
        }
        let text = &self.input[start..self.pos];
        Token::keyword(text).unwrap_or_else(|| Token::Ident(text.to_string()))
    }

    fn read_punct(&mut self) -> UdoResult<Token> {
        let c = self.current().expect("read_punct at end of input");
        let two = |lexer: &mut Self, token| {
            lexer.advance();
            lexer.advance();
            token
        };
        let token = match (c, self.peek(1), self.peek(2)) {
            (':', Some(':'), _) => two(self, Token::ColonColon),
            ('-', Some('>'), _) => two(self, Token::Arrow),
            ('<', Some('<'), Some('=')) => {
                self.advance();
                two(self, Token::ShlAssign)
            }
            ('>', Some('>'), Some('=')) => {
                self.advance();
                two(self, Token::ShrAssign)
            }
            ('<', Some('<'), _) => two(self, Token::Shl),
            ('>', Some('>'), _) => two(self, Token::Shr),
            ('<', Some('='), _) => two(self, Token::Le),
            ('>', Some('='), _) => two(self, Token::Ge),
            ('=', Some('='), _) => two(self, Token::EqEq),
            ('!', Some('='), _) => two(self, Token::Ne),
            ('&', Some('&'), _) => two(self, Token::AmpAmp),
            ('|', Some('|'), _) => two(self, Token::PipePipe),
            ('+', Some('+'), _) => two(self, Token::PlusPlus),
            ('-', Some('-'), _) => two(self, Token::MinusMinus),
            ('+', Some('='), _) => two(self, Token::PlusAssign),
            ('-', Some('='), _) => two(self, Token::MinusAssign),
            ('*', Some('='), _) => two(self, Token::StarAssign),
            ('/', Some('='), _) => two(self, Token::SlashAssign),
            ('%', Some('='), _) => two(self, Token::PercentAssign),
            ('&', Some('='), _) => two(self, Token::AmpAssign),
            ('|', Some('='), _) => two(self, Token::PipeAssign),
            ('^', Some('='), _) => two(self, Token::CaretAssign),
            _ => {
                self.advance();
                match c {
                    ';' => Token::Semi,
                    ',' => Token::Comma,
                    '.' => Token::Dot,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '<' => Token::Lt,
                    '>' => Token::Gt,
                    '=' => Token::Assign,
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '&' => Token::Amp,
                    '|' => Token::Pipe,
                    '^' => Token::Caret,
                    '~' => Token::Tilde,
                    '!' => Token::Not,
                    ':' => Token::Colon,
                    '?' => Token::Question,
                    other => return Err(self.error(format!("unexpected character '{}'", other))),
                }
            }
        };
        Ok(token)
    }

    /// Lex the whole input
    pub fn tokenize(mut self) -> UdoResult<Vec<TokenWithLoc>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let loc = self.loc();
            let token = match self.current() {
                None => break,
                Some('"') => self.read_string()?,
                Some('\'') => self.read_char()?,
                Some(c) if c.is_ascii_digit() => self.read_number()?,
                Some(c) if c.is_ascii_alphabetic() || c == '_' => self.read_ident(),
                Some(_) => self.read_punct()?,
            };
            tokens.push(TokenWithLoc { token, loc });
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str) -> Vec<Token> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            lex("struct Demo"),
            vec![Token::KwStruct, Token::Ident("Demo".into())]
        );
    }

    #[test]
    fn preprocessor_lines_are_skipped() {
        assert_eq!(
            lex("#include <udo/UDOperator.hpp>\nint x;"),
            vec![
                Token::KwInt,
                Token::Ident("x".into()),
                Token::Semi,
            ]
        );
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(
            lex("42 0x2a 7ull"),
            vec![Token::IntLit(42), Token::IntLit(42), Token::IntLit(7)]
        );
        assert_eq!(
            lex("1.5 2.0f"),
            vec![
                Token::FloatLit {
                    value: 1.5,
                    is_f32: false
                },
                Token::FloatLit {
                    value: 2.0,
                    is_f32: true
                },
            ]
        );
    }

    #[test]
    fn compound_punctuation() {
        assert_eq!(
            lex("a::b -> <<= >= &&"),
            vec![
                Token::Ident("a".into()),
                Token::ColonColon,
                Token::Ident("b".into()),
                Token::Arrow,
                Token::ShlAssign,
                Token::Ge,
                Token::AmpAmp,
            ]
        );
    }

    #[test]
    fn comments_are_trivia() {
        assert_eq!(
            lex("x // line\n/* block\n */ y"),
            vec![Token::Ident("x".into()), Token::Ident("y".into())]
        );
    }

    #[test]
    fn hex_literal_mixed_with_others() {
        assert_eq!(lex("0x2a"), vec![Token::IntLit(42)]);
    }
}
