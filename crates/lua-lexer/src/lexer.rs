use crate::token::{Token, TokenKind};
use lua_core::number::parse_hex;
use lua_core::SyntaxError;

/// Lazily tokenises a Lua 5.4 source string.
///
/// Tokens are produced on demand by [`Lexer::next_token`]. Lookahead is served
/// from a pushback stack: [`Lexer::peek`] scans one token and parks it there,
/// and [`Lexer::push_back`] un-consumes a token the parser already took.
///
/// Short strings are not scanned as a whole: the lexer hands out a
/// [`TokenKind::Quote`] and the parser reads the body with
/// [`Lexer::parse_string`]. Because the body follows the quote directly in
/// the source, the parser must call `parse_string` before looking further
/// ahead.
pub struct Lexer<'src> {
    src: &'src [u8],
    pos: usize,
    line: u32,
    /// Byte offset of the first character of the current line.
    line_start: usize,
    chunk: String,
    pushback: Vec<Token>,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Self {
        Self::with_chunk_name(src, "?")
    }

    /// Create a lexer whose errors are reported against `chunk`.
    pub fn with_chunk_name(src: &'src str, chunk: impl Into<String>) -> Self {
        let mut lexer = Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
            chunk: chunk.into(),
            pushback: Vec::new(),
        };
        lexer.skip_shebang();
        lexer
    }

    pub fn chunk_name(&self) -> &str {
        &self.chunk
    }

    /// Consume the entire source and return all tokens, including a final
    /// `Eof`. Short strings are decoded into [`TokenKind::LuaString`].
    pub fn tokenize(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            let mut tok = self.next_token()?;
            if let TokenKind::Quote(q) = tok.kind {
                tok.kind = TokenKind::LuaString(self.parse_string(q)?);
            }
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    // ── token stream ─────────────────────────────────────────────────────────

    /// Return the next token, consuming it.
    pub fn next_token(&mut self) -> Result<Token, SyntaxError> {
        match self.pushback.pop() {
            Some(tok) => Ok(tok),
            None => self.scan(),
        }
    }

    /// Return the next token without consuming it.
    pub fn peek(&mut self) -> Result<&Token, SyntaxError> {
        if self.pushback.is_empty() {
            let tok = self.scan()?;
            self.pushback.push(tok);
        }
        match self.pushback.last() {
            Some(tok) => Ok(tok),
            None => Err(self.error_here("unexpected end of token stream")),
        }
    }

    /// Un-consume `tok`; it will be returned by the next `next_token`/`peek`.
    pub fn push_back(&mut self, tok: Token) {
        self.pushback.push(tok);
    }

    /// Consume the next token, failing unless it has the same type as `kind`.
    pub fn expect(&mut self, kind: &TokenKind) -> Result<Token, SyntaxError> {
        let tok = self.next_token()?;
        if tok.kind.same_type(kind) {
            Ok(tok)
        } else {
            let expected = match kind {
                TokenKind::Name(_) => "<name>".to_string(),
                TokenKind::Number(_) => "<number>".to_string(),
                TokenKind::LuaString(_) | TokenKind::Quote(_) => "<string>".to_string(),
                other => other.to_string(),
            };
            Err(self.error_at(&tok, format!("{expected} expected near {}", tok.kind)))
        }
    }

    /// Build a syntax error located at `tok`.
    pub fn error_at(&self, tok: &Token, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.chunk.clone(), tok.line, tok.column, message)
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.chunk.clone(), self.line, self.column(), message)
    }

    fn column(&self) -> u32 {
        (self.pos - self.line_start + 1) as u32
    }

    // ── internal helpers ────────────────────────────────────────────────────

    fn peek_byte(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.src.get(self.pos).copied()?;
        self.pos += 1;
        if ch == b'\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(ch)
    }

    fn eat_if(&mut self, expected: u8) -> bool {
        if self.peek_byte() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn current_str(&self, start: usize) -> &str {
        std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("")
    }

    /// A `#` on the very first line starts a shebang line that is ignored.
    fn skip_shebang(&mut self) {
        if self.peek_byte() == Some(b'#') {
            while !matches!(self.peek_byte(), Some(b'\n') | None) {
                self.advance();
            }
        }
    }

    // ── whitespace & comments ───────────────────────────────────────────────

    fn skip_whitespace_and_comments(&mut self) -> Result<(), SyntaxError> {
        loop {
            while matches!(
                self.peek_byte(),
                Some(b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c)
            ) {
                self.advance();
            }

            if self.peek_byte() == Some(b'-') && self.peek2() == Some(b'-') {
                self.advance();
                self.advance();

                if let Some(level) = self.long_bracket_level() {
                    self.read_long_bracket(level, "unfinished long comment")?;
                    continue;
                }

                while !matches!(self.peek_byte(), Some(b'\n') | None) {
                    self.advance();
                }
            } else {
                return Ok(());
            }
        }
    }

    /// If the cursor sits on a long-bracket opener `[==[`, return its level.
    fn long_bracket_level(&self) -> Option<usize> {
        if self.peek_byte() != Some(b'[') {
            return None;
        }
        let mut i = self.pos + 1;
        let mut level = 0;
        while self.src.get(i) == Some(&b'=') {
            level += 1;
            i += 1;
        }
        (self.src.get(i) == Some(&b'[')).then_some(level)
    }

    /// Consume a long bracket `[==[ ... ]==]` whose opener starts at the
    /// cursor, returning the body.
    fn read_long_bracket(&mut self, level: usize, unfinished: &str) -> Result<String, SyntaxError> {
        let (line, column) = (self.line, self.column());
        for _ in 0..level + 2 {
            self.advance();
        }
        // A newline right after the opener is not part of the body.
        if self.peek_byte() == Some(b'\r') {
            self.advance();
            self.eat_if(b'\n');
        } else {
            self.eat_if(b'\n');
        }

        let body_start = self.pos;
        loop {
            match self.advance() {
                None => {
                    return Err(SyntaxError::new(self.chunk.clone(), line, column, unfinished));
                }
                Some(b']') => {
                    let close_start = self.pos - 1;
                    let mut eq = 0;
                    while self.peek_byte() == Some(b'=') {
                        self.advance();
                        eq += 1;
                    }
                    if eq == level && self.eat_if(b']') {
                        let body = &self.src[body_start..close_start];
                        return Ok(String::from_utf8_lossy(body).into_owned());
                    }
                }
                Some(_) => {}
            }
        }
    }

    // ── literals ────────────────────────────────────────────────────────────

    /// Read the body of a short string whose opening quote has already been
    /// consumed, up to and including `terminator`.
    pub fn parse_string(&mut self, terminator: u8) -> Result<String, SyntaxError> {
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let ch = match self.peek_byte() {
                None | Some(b'\n') | Some(b'\r') => {
                    return Err(self.error_here("unfinished string"));
                }
                Some(c) => c,
            };
            self.advance();
            if ch == terminator {
                break;
            }
            if ch != b'\\' {
                buf.push(ch);
                continue;
            }
            let escaped = match self.peek_byte() {
                Some(b'a') => Some(0x07),
                Some(b'b') => Some(0x08),
                Some(b'f') => Some(0x0c),
                Some(b'n') => Some(b'\n'),
                Some(b'r') => Some(b'\r'),
                Some(b't') => Some(b'\t'),
                Some(b'v') => Some(0x0b),
                Some(b'\\') => Some(b'\\'),
                Some(b'"') => Some(b'"'),
                Some(b'\'') => Some(b'\''),
                // An escaped line break is counted but adds nothing.
                Some(b'\n') => None,
                Some(b'\r') => {
                    self.advance();
                    if self.peek_byte() == Some(b'\n') {
                        self.advance();
                    } else {
                        self.line += 1;
                        self.line_start = self.pos;
                    }
                    continue;
                }
                Some(b'x') => {
                    self.advance();
                    let mut value = 0u8;
                    for _ in 0..2 {
                        let digit = self
                            .peek_byte()
                            .and_then(|c| (c as char).to_digit(16))
                            .ok_or_else(|| self.error_here("hexadecimal digit expected"))?;
                        self.advance();
                        value = value * 16 + digit as u8;
                    }
                    buf.push(value);
                    continue;
                }
                Some(b'z') => {
                    self.advance();
                    while matches!(self.peek_byte(), Some(b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c)) {
                        self.advance();
                    }
                    continue;
                }
                Some(b'u') => {
                    self.advance();
                    let ch = self.utf8_escape()?;
                    let mut tmp = [0u8; 4];
                    buf.extend_from_slice(ch.encode_utf8(&mut tmp).as_bytes());
                    continue;
                }
                Some(c) if c.is_ascii_digit() => {
                    let mut value = 0u32;
                    for _ in 0..3 {
                        match self.peek_byte() {
                            Some(d) if d.is_ascii_digit() => {
                                value = value * 10 + u32::from(d - b'0');
                                self.advance();
                            }
                            _ => break,
                        }
                    }
                    let byte = u8::try_from(value).map_err(|_| self.error_here("decimal escape too large"))?;
                    buf.push(byte);
                    continue;
                }
                _ => return Err(self.error_here("invalid escape sequence")),
            };
            self.advance();
            if let Some(b) = escaped {
                buf.push(b);
            }
        }
        // Byte escapes must still spell out UTF-8 text.
        String::from_utf8(buf).map_err(|_| self.error_here("invalid escape sequence"))
    }

    /// The `{XXX}` part of a `\u{XXX}` escape.
    fn utf8_escape(&mut self) -> Result<char, SyntaxError> {
        if !self.eat_if(b'{') {
            return Err(self.error_here("missing '{' in \\u{xxxx}"));
        }
        let mut code = 0u32;
        let mut digits = 0;
        while let Some(d) = self.peek_byte().and_then(|c| (c as char).to_digit(16)) {
            code = code
                .checked_mul(16)
                .map(|c| c + d)
                .filter(|&c| c <= 0x7FFF_FFFF)
                .ok_or_else(|| self.error_here("UTF-8 value too large"))?;
            digits += 1;
            self.advance();
        }
        if digits == 0 {
            return Err(self.error_here("hexadecimal digit expected"));
        }
        if !self.eat_if(b'}') {
            return Err(self.error_here("missing '}' in \\u{xxxx}"));
        }
        char::from_u32(code).ok_or_else(|| self.error_here("UTF-8 value too large"))
    }

    fn read_number(&mut self, first: u8) -> Result<TokenKind, SyntaxError> {
        let start = self.pos - 1;
        let value = if first == b'0' && matches!(self.peek_byte(), Some(b'x' | b'X')) {
            self.advance();
            let digits_start = self.pos;
            while self.peek_byte().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance();
            }
            parse_hex(self.current_str(digits_start))
        } else {
            while self.peek_byte().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
            if self.peek_byte() == Some(b'.') && self.peek2() != Some(b'.') {
                self.advance();
                while self.peek_byte().is_some_and(|c| c.is_ascii_digit()) {
                    self.advance();
                }
            }
            if matches!(self.peek_byte(), Some(b'e' | b'E')) {
                self.advance();
                if matches!(self.peek_byte(), Some(b'+' | b'-')) {
                    self.advance();
                }
                while self.peek_byte().is_some_and(|c| c.is_ascii_digit()) {
                    self.advance();
                }
            }
            lua_core::number::parse_number(self.current_str(start))
        };

        // A number running straight into a name character is malformed (`3x`, `0x1p4`).
        if self
            .peek_byte()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            while self
                .peek_byte()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
            {
                self.advance();
            }
            return Err(self.malformed_number(start));
        }
        value
            .map(TokenKind::Number)
            .ok_or_else(|| self.malformed_number(start))
    }

    fn malformed_number(&self, start: usize) -> SyntaxError {
        let column = (start - self.line_start + 1) as u32;
        SyntaxError::new(
            self.chunk.clone(),
            self.line,
            column,
            format!("malformed number near '{}'", self.current_str(start)),
        )
    }

    // ── main dispatch ────────────────────────────────────────────────────────

    fn scan(&mut self) -> Result<Token, SyntaxError> {
        self.skip_whitespace_and_comments()?;
        let (line, column) = (self.line, self.column());

        if let Some(level) = self.long_bracket_level() {
            let s = self.read_long_bracket(level, "unfinished long string")?;
            return Ok(Token::new(TokenKind::LuaString(s), line, column));
        }

        let ch = match self.advance() {
            None => return Ok(Token::new(TokenKind::Eof, line, column)),
            Some(c) => c,
        };

        let kind = match ch {
            b'0'..=b'9' => self.read_number(ch)?,
            b'.' if self.peek_byte().is_some_and(|c| c.is_ascii_digit()) => self.read_number(ch)?,

            b'"' | b'\'' => TokenKind::Quote(ch),

            b'_' | b'a'..=b'z' | b'A'..=b'Z' => {
                let start = self.pos - 1;
                while self
                    .peek_byte()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
                {
                    self.advance();
                }
                let s = self.current_str(start);
                TokenKind::keyword(s).unwrap_or_else(|| TokenKind::Name(s.to_owned()))
            }

            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'%' => TokenKind::Percent,
            b'^' => TokenKind::Caret,
            b'&' => TokenKind::Ampersand,
            b'|' => TokenKind::Pipe,
            b'#' => TokenKind::Hash,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b';' => TokenKind::Semicolon,
            b',' => TokenKind::Comma,

            b'/' => {
                if self.eat_if(b'/') {
                    TokenKind::SlashSlash
                } else {
                    TokenKind::Slash
                }
            }
            b'~' => {
                if self.eat_if(b'=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Tilde
                }
            }
            b'<' => {
                if self.eat_if(b'<') {
                    TokenKind::ShiftLeft
                } else if self.eat_if(b'=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.eat_if(b'>') {
                    TokenKind::ShiftRight
                } else if self.eat_if(b'=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            b'=' => {
                if self.eat_if(b'=') {
                    TokenKind::Eq
                } else {
                    TokenKind::Assign
                }
            }
            b':' => {
                if self.eat_if(b':') {
                    TokenKind::ColonColon
                } else {
                    TokenKind::Colon
                }
            }
            b'.' => {
                if self.eat_if(b'.') {
                    if self.eat_if(b'.') {
                        TokenKind::DotDotDot
                    } else {
                        TokenKind::DotDot
                    }
                } else {
                    TokenKind::Dot
                }
            }

            other => {
                let shown = if other.is_ascii_graphic() {
                    format!("'{}'", other as char)
                } else {
                    format!("'<\\{other}>'")
                };
                return Err(SyntaxError::new(
                    self.chunk.clone(),
                    line,
                    column,
                    format!("unexpected symbol near {shown}"),
                ));
            }
        };

        Ok(Token::new(kind, line, column))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn lex_err(src: &str) -> SyntaxError {
        Lexer::new(src).tokenize().unwrap_err()
    }

    fn name(s: &str) -> TokenKind {
        TokenKind::Name(s.into())
    }

    fn string(s: &str) -> TokenKind {
        TokenKind::LuaString(s.into())
    }

    // ── EOF / whitespace ────────────────────────────────────────

    #[test]
    fn empty_source_yields_eof() {
        assert_eq!(lex(""), vec![TokenKind::Eof]);
        assert_eq!(lex("  \n\t "), vec![TokenKind::Eof]);
    }

    #[test]
    fn shebang_line_is_skipped() {
        assert_eq!(lex("#!/usr/bin/lua\nx"), vec![name("x"), TokenKind::Eof]);
    }

    // ── Comments ────────────────────────────────────────────────

    #[test]
    fn line_and_block_comments() {
        assert_eq!(
            lex("a -- comment\n--[[ block\n comment ]] b --[==[ x ]] ]==] c"),
            vec![name("a"), name("b"), name("c"), TokenKind::Eof]
        );
    }

    #[test]
    fn unterminated_block_comment_fails() {
        let err = lex_err("x --[[ never closed");
        assert!(err.message.contains("unfinished long comment"), "{err}");
        assert_eq!((err.line, err.column), (1, 5));
    }

    // ── Names and keywords ──────────────────────────────────────

    #[test]
    fn keywords_and_names() {
        assert_eq!(
            lex("local function _foo2 end"),
            vec![
                TokenKind::Local,
                TokenKind::Function,
                name("_foo2"),
                TokenKind::End,
                TokenKind::Eof
            ]
        );
    }

    // ── Numbers ─────────────────────────────────────────────────

    #[test]
    fn numbers_are_all_floats() {
        assert_eq!(
            lex("3 3.0 .5 1e2 2.5E-1 0xff 0XA"),
            vec![
                TokenKind::Number(3.0),
                TokenKind::Number(3.0),
                TokenKind::Number(0.5),
                TokenKind::Number(100.0),
                TokenKind::Number(0.25),
                TokenKind::Number(255.0),
                TokenKind::Number(10.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn number_followed_by_concat() {
        assert_eq!(
            lex("1..2"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::DotDot,
                TokenKind::Number(2.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn malformed_numbers() {
        assert!(lex_err("3x").message.contains("malformed number near '3x'"));
        assert!(lex_err("1e+").message.contains("malformed number"));
        assert!(lex_err("0x1p4").message.contains("malformed number"));
        assert!(lex_err("0x").message.contains("malformed number"));
    }

    // ── Strings ─────────────────────────────────────────────────

    #[test]
    fn short_strings_with_escapes() {
        assert_eq!(
            lex(r#""a\tb\n" 'it\'s' "q\"\\""#),
            vec![string("a\tb\n"), string("it's"), string("q\"\\"), TokenKind::Eof]
        );
    }

    #[test]
    fn escaped_newline_is_counted_but_dropped() {
        let mut lexer = Lexer::new("\"ab\\\ncd\" x");
        let quote = lexer.next_token().unwrap();
        assert_eq!(quote.kind, TokenKind::Quote(b'"'));
        assert_eq!(lexer.parse_string(b'"').unwrap(), "abcd");
        let next = lexer.next_token().unwrap();
        assert_eq!(next.kind, name("x"));
        assert_eq!(next.line, 2);

        let mut lexer = Lexer::new("'a\\\r\nb\\\rc' y");
        lexer.next_token().unwrap();
        assert_eq!(lexer.parse_string(b'\'').unwrap(), "abc");
        assert_eq!(lexer.next_token().unwrap().line, 3);
    }

    #[test]
    fn invalid_escape_is_rejected() {
        assert!(lex_err(r#""\q""#).message.contains("invalid escape sequence"));
        assert!(lex_err(r#""\xZZ""#).message.contains("hexadecimal digit expected"));
        assert!(lex_err(r#""\300""#).message.contains("decimal escape too large"));
        assert!(lex_err(r#""\u{110000000}""#).message.contains("UTF-8 value too large"));
    }

    #[test]
    fn byte_escapes_must_form_utf8() {
        assert!(lex_err(r#""\xff""#).message.contains("invalid escape sequence"));
        assert!(lex_err(r#""\u{e9}\255""#).message.contains("invalid escape sequence"));
        assert_eq!(lex(r#""\xc3\xa9\195\169""#), vec![string("\u{e9}\u{e9}"), TokenKind::Eof]);
    }

    #[test]
    fn numeric_and_unicode_escapes() {
        assert_eq!(
            lex(r#""\65\066\x43" "\u{48}\u{e9}" "a\z
                   b""#),
            vec![string("ABC"), string("H\u{e9}"), string("ab"), TokenKind::Eof]
        );
    }

    #[test]
    fn unfinished_strings() {
        assert!(lex_err("\"abc").message.contains("unfinished string"));
        assert!(lex_err("'abc\n'").message.contains("unfinished string"));
    }

    #[test]
    fn long_strings_keep_contents_verbatim() {
        assert_eq!(
            lex("[[\nline1\nline2]] [==[a]]b]==]"),
            vec![string("line1\nline2"), string("a]]b"), TokenKind::Eof]
        );
    }

    // ── Operators ───────────────────────────────────────────────

    #[test]
    fn multi_char_operators() {
        assert_eq!(
            lex("// ~= <= >= << >> == :: ... .. ~"),
            vec![
                TokenKind::SlashSlash,
                TokenKind::NotEq,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::ShiftLeft,
                TokenKind::ShiftRight,
                TokenKind::Eq,
                TokenKind::ColonColon,
                TokenKind::DotDotDot,
                TokenKind::DotDot,
                TokenKind::Tilde,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn unexpected_character() {
        let err = lex_err("a = $");
        assert_eq!(err.message, "unexpected symbol near '$'");
        assert_eq!((err.line, err.column), (1, 5));
    }

    // ── Stream API ──────────────────────────────────────────────

    #[test]
    fn peek_and_push_back() {
        let mut lexer = Lexer::new("a b");
        assert_eq!(lexer.peek().unwrap().kind, name("a"));
        assert_eq!(lexer.peek().unwrap().kind, name("a"));
        let a = lexer.next_token().unwrap();
        let b = lexer.next_token().unwrap();
        assert_eq!(b.kind, name("b"));
        lexer.push_back(b);
        lexer.push_back(a);
        assert_eq!(lexer.next_token().unwrap().kind, name("a"));
        assert_eq!(lexer.next_token().unwrap().kind, name("b"));
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn expect_reports_expected_and_actual() {
        let mut lexer = Lexer::with_chunk_name("if x end", "t.lua");
        lexer.expect(&TokenKind::If).unwrap();
        lexer.expect(&TokenKind::Name(String::new())).unwrap();
        let err = lexer.expect(&TokenKind::Then).unwrap_err();
        assert_eq!(err.to_string(), "t.lua:1:6: 'then' expected near 'end'");
    }

    #[test]
    fn tokens_carry_columns() {
        let tokens = Lexer::new("x = 1\n  y").tokenize().unwrap();
        let positions: Vec<_> = tokens.iter().map(|t| (t.line, t.column)).collect();
        assert_eq!(positions, vec![(1, 1), (1, 3), (1, 5), (2, 3), (2, 4)]);
    }
}
