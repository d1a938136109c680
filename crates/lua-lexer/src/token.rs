use std::fmt;

/// A single lexical token produced by the [`crate::Lexer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// 1-based source line where this token starts.
    pub line: u32,
    /// 1-based column (byte offset from the start of the line).
    pub column: u32,
}

impl Token {
    pub fn new(kind: TokenKind, line: u32, column: u32) -> Self {
        Self { kind, line, column }
    }
}

/// Every token kind in the Lua 5.4 grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // ── Literals ───────────────────────────────────────────────────────────
    /// All numeric literals share one floating-point representation.
    Number(f64),
    /// A long-bracket string (`[[...]]`), fully decoded by the lexer.
    LuaString(String),
    /// Opening `"` or `'` of a short string. The body is read afterwards
    /// through [`crate::Lexer::parse_string`].
    Quote(u8),
    Name(String),

    // ── Keywords ───────────────────────────────────────────────────────────
    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    Goto,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    // ── Arithmetic / bitwise operators ─────────────────────────────────────
    Plus,       // +
    Minus,      // -
    Star,       // *
    Slash,      // /
    SlashSlash, // //
    Percent,    // %
    Caret,      // ^
    Ampersand,  // &
    Tilde,      // ~
    Pipe,       // |
    ShiftLeft,  // <<
    ShiftRight, // >>

    // ── Comparison / misc operators ────────────────────────────────────────
    Hash,  // #
    Eq,    // ==
    NotEq, // ~=
    Lt,    // <
    LtEq,  // <=
    Gt,    // >
    GtEq,  // >=

    // ── Assignment ─────────────────────────────────────────────────────────
    Assign, // =

    // ── Delimiters / punctuation ───────────────────────────────────────────
    LParen,     // (
    RParen,     // )
    LBrace,     // {
    RBrace,     // }
    LBracket,   // [
    RBracket,   // ]
    ColonColon, // ::
    Semicolon,  // ;
    Colon,      // :
    Comma,      // ,
    Dot,        // .
    DotDot,     // ..
    DotDotDot,  // ...

    // ── End-of-file ────────────────────────────────────────────────────────
    Eof,
}

impl TokenKind {
    /// Map a keyword string to its `TokenKind`, or return `None` if it is not
    /// a keyword (caller should treat it as a [`TokenKind::Name`]).
    pub fn keyword(s: &str) -> Option<TokenKind> {
        Some(match s {
            "and" => TokenKind::And,
            "break" => TokenKind::Break,
            "do" => TokenKind::Do,
            "else" => TokenKind::Else,
            "elseif" => TokenKind::Elseif,
            "end" => TokenKind::End,
            "false" => TokenKind::False,
            "for" => TokenKind::For,
            "function" => TokenKind::Function,
            "goto" => TokenKind::Goto,
            "if" => TokenKind::If,
            "in" => TokenKind::In,
            "local" => TokenKind::Local,
            "nil" => TokenKind::Nil,
            "not" => TokenKind::Not,
            "or" => TokenKind::Or,
            "repeat" => TokenKind::Repeat,
            "return" => TokenKind::Return,
            "then" => TokenKind::Then,
            "true" => TokenKind::True,
            "until" => TokenKind::Until,
            "while" => TokenKind::While,
            _ => return None,
        })
    }

    /// Whether two kinds are the same token type, ignoring payloads.
    pub fn same_type(&self, other: &TokenKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Source text of fixed tokens.
    fn symbol(&self) -> Option<&'static str> {
        Some(match self {
            TokenKind::And => "and",
            TokenKind::Break => "break",
            TokenKind::Do => "do",
            TokenKind::Else => "else",
            TokenKind::Elseif => "elseif",
            TokenKind::End => "end",
            TokenKind::False => "false",
            TokenKind::For => "for",
            TokenKind::Function => "function",
            TokenKind::Goto => "goto",
            TokenKind::If => "if",
            TokenKind::In => "in",
            TokenKind::Local => "local",
            TokenKind::Nil => "nil",
            TokenKind::Not => "not",
            TokenKind::Or => "or",
            TokenKind::Repeat => "repeat",
            TokenKind::Return => "return",
            TokenKind::Then => "then",
            TokenKind::True => "true",
            TokenKind::Until => "until",
            TokenKind::While => "while",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::SlashSlash => "//",
            TokenKind::Percent => "%",
            TokenKind::Caret => "^",
            TokenKind::Ampersand => "&",
            TokenKind::Tilde => "~",
            TokenKind::Pipe => "|",
            TokenKind::ShiftLeft => "<<",
            TokenKind::ShiftRight => ">>",
            TokenKind::Hash => "#",
            TokenKind::Eq => "==",
            TokenKind::NotEq => "~=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::Assign => "=",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::ColonColon => "::",
            TokenKind::Semicolon => ";",
            TokenKind::Colon => ":",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::DotDot => "..",
            TokenKind::DotDotDot => "...",
            _ => return None,
        })
    }
}

/// Renders the token the way it reads in error messages: `'then'`, `'x'`,
/// `<eof>`.
impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sym) = self.symbol() {
            return write!(f, "'{sym}'");
        }
        match self {
            TokenKind::Number(n) => write!(f, "'{}'", lua_core::number::format_number(*n)),
            TokenKind::LuaString(s) => write!(f, "'[[{s}]]'"),
            TokenKind::Quote(q) => write!(f, "'{}'", *q as char),
            TokenKind::Name(name) => write!(f, "'{name}'"),
            _ => f.write_str("<eof>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_looked_up() {
        assert_eq!(TokenKind::keyword("while"), Some(TokenKind::While));
        assert_eq!(TokenKind::keyword("whilst"), None);
    }

    #[test]
    fn display_matches_source_text() {
        assert_eq!(TokenKind::Then.to_string(), "'then'");
        assert_eq!(TokenKind::DotDot.to_string(), "'..'");
        assert_eq!(TokenKind::Name("x".into()).to_string(), "'x'");
        assert_eq!(TokenKind::Eof.to_string(), "<eof>");
    }

    #[test]
    fn same_type_ignores_payload() {
        assert!(TokenKind::Name("a".into()).same_type(&TokenKind::Name("b".into())));
        assert!(!TokenKind::Name("a".into()).same_type(&TokenKind::Number(1.0)));
    }
}
