use thiserror::Error;

/// A lexing, parsing or compilation failure.
///
/// Always fatal to the compile attempt: the front end does not recover or
/// collect multiple errors.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{}: {}", location(.chunk, .line, .column), .message)]
pub struct SyntaxError {
    pub chunk: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl SyntaxError {
    pub fn new(chunk: impl Into<String>, line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            chunk: chunk.into(),
            line,
            column,
            message: message.into(),
        }
    }
}

/// Column 0 marks errors found after parsing, where only the line is known.
fn location(chunk: &str, line: &u32, column: &u32) -> String {
    if *column == 0 {
        format!("{chunk}:{line}")
    } else {
        format!("{chunk}:{line}:{column}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_location() {
        let err = SyntaxError::new("main.lua", 3, 7, "unexpected symbol near ')'");
        assert_eq!(err.to_string(), "main.lua:3:7: unexpected symbol near ')'");

        let err = SyntaxError::new("main.lua", 5, 0, "no visible label 'top' for goto");
        assert_eq!(err.to_string(), "main.lua:5: no visible label 'top' for goto");
    }
}
