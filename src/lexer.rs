use crate::error::{ErrorKind, Exception};
use crate::token::{lookup_ident, FileId, Span, Token, TokenKind};

/// Turns a source buffer into a spanned token stream ending in `Eof`.
///
/// Newlines are emitted as tokens so the parser can treat them as statement
/// separators; comments and other whitespace are discarded here.
pub struct Lexer<'a> {
    input: &'a str,
    file: FileId,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str, file: FileId) -> Lexer<'a> {
        Lexer {
            input,
            file,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    /// Lexes the whole buffer eagerly. Unknown characters become `Illegal`
    /// tokens for the parser to surface; only an unterminated string or
    /// block comment fails outright.
    pub fn tokenize(mut self) -> Result<Vec<Token>, Exception> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, Exception> {
        self.skip_insignificant()?;

        let start = self.mark();
        let kind = match self.read_char() {
            None => TokenKind::Eof,
            Some('\n') => TokenKind::Newline,
            Some('=') => {
                if self.peek_char() == Some('=') {
                    self.read_char();
                    TokenKind::Eq
                } else {
                    TokenKind::Assign
                }
            }
            Some('!') => {
                if self.peek_char() == Some('=') {
                    self.read_char();
                    TokenKind::Ne
                } else {
                    TokenKind::Illegal('!')
                }
            }
            Some('<') => {
                if self.peek_char() == Some('=') {
                    self.read_char();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            Some('>') => {
                if self.peek_char() == Some('=') {
                    self.read_char();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            Some('+') => TokenKind::Plus,
            Some('-') => TokenKind::Minus,
            Some('*') => TokenKind::Asterisk,
            Some('/') => TokenKind::Slash,
            Some('%') => TokenKind::Percent,
            Some('(') => TokenKind::OpenParen,
            Some(')') => TokenKind::CloseParen,
            Some('{') => TokenKind::OpenBrace,
            Some('}') => TokenKind::CloseBrace,
            Some('[') => TokenKind::OpenBracket,
            Some(']') => TokenKind::CloseBracket,
            Some(',') => TokenKind::Comma,
            Some(';') => TokenKind::SemiColon,
            Some('.') => {
                if self.peek_if(|c| c.is_ascii_digit()) {
                    self.read_number_from('.')
                } else {
                    TokenKind::Dot
                }
            }
            Some(q @ ('"' | '\'')) => self.read_string(q, start)?,
            Some(c) if c.is_ascii_digit() => self.read_number_from(c),
            Some(c) if is_id_start(c) => {
                let ident = self.read_identifier(c);
                lookup_ident(&ident).unwrap_or(TokenKind::Ident(ident))
            }
            Some(c) => TokenKind::Illegal(c),
        };

        Ok(self.spanned(kind, start))
    }

    /// Skips spaces, tabs, carriage returns, and all three comment forms.
    fn skip_insignificant(&mut self) -> Result<(), Exception> {
        loop {
            match self.peek_char() {
                Some(' ' | '\t' | '\r') => {
                    self.read_char();
                }
                Some('#') => self.skip_line_comment(),
                Some('/') if self.peek_next() == Some('/') => self.skip_line_comment(),
                Some('/') if self.peek_next() == Some('*') => self.skip_block_comment()?,
                _ => return Ok(()),
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while self.peek_if(|c| c != '\n') {
            self.read_char();
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), Exception> {
        let start = self.mark();
        self.read_char(); // '/'
        self.read_char(); // '*'

        loop {
            match self.read_char() {
                Some('*') if self.peek_char() == Some('/') => {
                    self.read_char();
                    return Ok(());
                }
                Some(_) => {}
                None => {
                    return Err(Exception::new(
                        ErrorKind::Syntax,
                        "unterminated block comment",
                        self.span_from(start),
                    ))
                }
            }
        }
    }

    fn read_string(&mut self, quote: char, start: Mark) -> Result<TokenKind, Exception> {
        let mut value = String::new();

        loop {
            match self.read_char() {
                Some(c) if c == quote => return Ok(TokenKind::Str(value)),
                Some('\\') => match self.read_char() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('\\') => value.push('\\'),
                    Some('\'') => value.push('\''),
                    Some('"') => value.push('"'),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => break,
                },
                Some('\n') | None => break,
                Some(c) => value.push(c),
            }
        }

        // Report the opening quote so the user sees where the literal began.
        Err(Exception::new(
            ErrorKind::Syntax,
            "unterminated string literal",
            self.span_from(start),
        ))
    }

    fn read_number_from(&mut self, first: char) -> TokenKind {
        let mut number = String::new();
        number.push(first);
        let mut is_float = first == '.';

        while self.peek_if(|c| c.is_ascii_digit()) {
            number.push(self.read_char().unwrap());
        }
        if !is_float
            && self.peek_char() == Some('.')
            && self.peek_next().is_some_and(|c| c.is_ascii_digit())
        {
            is_float = true;
            number.push(self.read_char().unwrap());
            while self.peek_if(|c| c.is_ascii_digit()) {
                number.push(self.read_char().unwrap());
            }
        }

        if is_float {
            TokenKind::Float(number.parse().unwrap_or(f64::INFINITY))
        } else {
            match number.parse() {
                Ok(v) => TokenKind::Int(v),
                Err(_) => TokenKind::Float(number.parse().unwrap_or(f64::INFINITY)),
            }
        }
    }

    fn read_identifier(&mut self, first: char) -> String {
        let mut ident = String::new();
        ident.push(first);

        while self.peek_if(is_id_continue) {
            ident.push(self.read_char().unwrap());
        }

        ident
    }

    fn read_char(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        self.input[self.pos..].chars().nth(1)
    }

    fn peek_if<F>(&self, predicate: F) -> bool
    where
        F: Fn(char) -> bool,
    {
        self.peek_char().is_some_and(predicate)
    }

    fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            line: self.line,
            column: self.column,
        }
    }

    fn span_from(&self, start: Mark) -> Span {
        Span::new(
            self.file,
            start.line,
            start.column,
            start.pos as u32,
            self.pos as u32,
        )
    }

    fn spanned(&self, kind: TokenKind, start: Mark) -> Token {
        Token {
            kind,
            span: self.span_from(start),
        }
    }
}

#[derive(Clone, Copy)]
struct Mark {
    pos: usize,
    line: u32,
    column: u32,
}

fn is_id_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_id_continue(c: char) -> bool {
    is_id_start(c) || c.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::FileId;

    fn lex(input: &str) -> Vec<TokenKind> {
        Lexer::new(input, FileId(0))
            .tokenize()
            .expect("lexing failed")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn test_lexing(input: &str, expected: Vec<TokenKind>) {
        assert_eq!(expected, lex(input), "for `{}`", input);
    }

    #[test]
    fn punctuation_and_operators() {
        test_lexing(
            "=+(){},;[]%.",
            vec![
                TokenKind::Assign,
                TokenKind::Plus,
                TokenKind::OpenParen,
                TokenKind::CloseParen,
                TokenKind::OpenBrace,
                TokenKind::CloseBrace,
                TokenKind::Comma,
                TokenKind::SemiColon,
                TokenKind::OpenBracket,
                TokenKind::CloseBracket,
                TokenKind::Percent,
                TokenKind::Dot,
                TokenKind::Eof,
            ],
        );
    }

    #[test]
    fn two_char_operators_beat_their_prefixes() {
        test_lexing(
            "== != <= >= < > =",
            vec![
                TokenKind::Eq,
                TokenKind::Ne,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Assign,
                TokenKind::Eof,
            ],
        );
    }

    #[test]
    fn keywords_and_identifiers() {
        test_lexing(
            "async def f not_in in is nothing",
            vec![
                TokenKind::Async,
                TokenKind::Def,
                TokenKind::Ident("f".to_owned()),
                TokenKind::Ident("not_in".to_owned()),
                TokenKind::In,
                TokenKind::Is,
                TokenKind::Ident("nothing".to_owned()),
                TokenKind::Eof,
            ],
        );
    }

    #[test]
    fn numbers() {
        test_lexing(
            "5 42 3.1415 0.5 .5 6.",
            vec![
                TokenKind::Int(5),
                TokenKind::Int(42),
                TokenKind::Float(3.1415),
                TokenKind::Float(0.5),
                TokenKind::Float(0.5),
                TokenKind::Int(6),
                TokenKind::Dot,
                TokenKind::Eof,
            ],
        );
    }

    #[test]
    fn strings_with_escapes() {
        test_lexing(
            r#""a\nb" 'it\'s' "q\"q""#,
            vec![
                TokenKind::Str("a\nb".to_owned()),
                TokenKind::Str("it's".to_owned()),
                TokenKind::Str("q\"q".to_owned()),
                TokenKind::Eof,
            ],
        );
    }

    #[test]
    fn comments_are_discarded() {
        test_lexing(
            "1 # line\n2 // c line\n/* block\nspanning */ 3",
            vec![
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Int(2),
                TokenKind::Newline,
                TokenKind::Int(3),
                TokenKind::Eof,
            ],
        );
    }

    #[test]
    fn newlines_are_tokens() {
        test_lexing(
            "a\nb",
            vec![
                TokenKind::Ident("a".to_owned()),
                TokenKind::Newline,
                TokenKind::Ident("b".to_owned()),
                TokenKind::Eof,
            ],
        );
    }

    #[test]
    fn unterminated_string_points_at_the_opening_quote() {
        let err = Lexer::new("x = \"oops", FileId(0)).tokenize().unwrap_err();

        assert_eq!(err.kind, ErrorKind::Syntax);
        assert_eq!(err.message, "unterminated string literal");
        let span = err.span.unwrap();
        assert_eq!((span.line, span.column), (1, 5));
    }

    #[test]
    fn unknown_characters_become_illegal_tokens() {
        test_lexing(
            "a @ b",
            vec![
                TokenKind::Ident("a".to_owned()),
                TokenKind::Illegal('@'),
                TokenKind::Ident("b".to_owned()),
                TokenKind::Eof,
            ],
        );
    }

    #[test]
    fn spans_track_lines_and_columns() {
        let tokens = Lexer::new("x = 1\ny = 2", FileId(0)).tokenize().unwrap();

        let spans: Vec<(u32, u32)> =
            tokens.iter().map(|t| (t.span.line, t.span.column)).collect();
        assert_eq!(
            spans,
            vec![(1, 1), (1, 3), (1, 5), (1, 6), (2, 1), (2, 3), (2, 5), (2, 6)]
        );
        assert_eq!(tokens[2].span.start, 4);
        assert_eq!(tokens[2].span.end, 5);
    }
}
