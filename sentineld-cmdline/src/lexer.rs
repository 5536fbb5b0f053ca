//! Quote-aware, delimiter-driven tokenizer and a bounded line reader.
//!
//! The shapes mirror a classic C lexer operating on a fixed buffer: rather
//! than mutating a shared buffer in place, [`next_token`] walks an
//! immutable `&str` and returns owned, already-unquoted tokens plus the
//! position to resume from.

use std::io::BufRead;
use thiserror::Error;

/// Maximum number of bytes accepted on a single inittab line, excluding the
/// newline. One byte less than the historical 4096-byte line buffer, to
/// leave room for the terminating NUL the original C parser relied on.
pub const LINE_SIZE: usize = 4095;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A complete, possibly quote-stripped token.
    Ok(String),
    /// Two delimiters (or a delimiter at the very start) with no content
    /// between them.
    Blank,
    /// The buffer was exhausted with no further delimiter: end of tokens.
    End,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated quote starting at byte offset {0}")]
    UnfinishedQuote(usize),
}

/// Pulls the next `delim`-terminated token out of `buf` starting at `*pos`,
/// advancing `*pos` past the delimiter. When `quoted` is true, `'` and `"`
/// toggle quoting and are stripped from the returned token; an unescaped
/// delimiter inside a quoted span is not a boundary.
pub fn next_token(
    buf: &str,
    pos: &mut usize,
    delim: u8,
    quoted: bool,
) -> Result<Token, LexError> {
    let bytes = buf.as_bytes();
    let start = *pos;
    if start >= bytes.len() {
        return Ok(Token::End);
    }

    let mut out = Vec::with_capacity(bytes.len() - start);
    let mut quoting = false;
    let mut quote = 0u8;
    let mut quote_start = start;
    let mut i = start;

    while i < bytes.len() && bytes[i] != 0 {
        let c = bytes[i];
        if !quoting {
            if c == delim {
                break;
            }
            if quoted && (c == b'\'' || c == b'"') {
                quote = c;
                quoting = true;
                quote_start = i;
                i += 1;
                continue;
            }
            out.push(c);
        } else if c == quote {
            quoting = false;
            quote = 0;
        } else {
            out.push(c);
        }
        i += 1;
    }

    if quoting {
        return Err(LexError::UnfinishedQuote(quote_start));
    }

    *pos = i + 1;

    if i == start {
        Ok(Token::Blank)
    } else {
        Ok(Token::Ok(String::from_utf8_lossy(&out).into_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextLine {
    Ok,
    Eof,
}

#[derive(Debug, Error)]
pub enum LineError {
    #[error("line exceeds the {LINE_SIZE}-byte limit")]
    TooBig,
    #[error("i/o error reading line: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads the next logical line of an inittab-style file into `buf`,
/// transparently skipping blank lines and `#`-prefixed comments, and
/// rejecting any physical line longer than [`LINE_SIZE`] bytes.
pub fn next_line<R: BufRead>(reader: &mut R, buf: &mut String) -> Result<NextLine, LineError> {
    loop {
        buf.clear();
        let mut raw = Vec::with_capacity(LINE_SIZE + 1);
        let mut saw_newline = false;
        loop {
            let available = match reader.fill_buf() {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LineError::Io(e)),
            };
            if available.is_empty() {
                break;
            }
            if let Some(nl) = available.iter().position(|&b| b == b'\n') {
                raw.extend_from_slice(&available[..nl]);
                reader.consume(nl + 1);
                saw_newline = true;
                break;
            } else {
                raw.extend_from_slice(available);
                let len = available.len();
                reader.consume(len);
            }
        }

        if raw.is_empty() && !saw_newline {
            return Ok(NextLine::Eof);
        }
        if raw.len() > LINE_SIZE {
            return Err(LineError::TooBig);
        }

        let line = String::from_utf8_lossy(&raw).into_owned();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        *buf = line;
        return Ok(NextLine::Ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn tokenizes_plain_space_delimited() {
        let buf = "foo bar baz";
        let mut pos = 0;
        assert_eq!(
            next_token(buf, &mut pos, b' ', true).unwrap(),
            Token::Ok("foo".into())
        );
        assert_eq!(
            next_token(buf, &mut pos, b' ', true).unwrap(),
            Token::Ok("bar".into())
        );
        assert_eq!(
            next_token(buf, &mut pos, b' ', true).unwrap(),
            Token::Ok("baz".into())
        );
        assert_eq!(next_token(buf, &mut pos, b' ', true).unwrap(), Token::End);
    }

    #[test]
    fn strips_full_quotes() {
        let buf = "B='x y' rest";
        let mut pos = 0;
        assert_eq!(
            next_token(buf, &mut pos, b' ', true).unwrap(),
            Token::Ok("B=x y".into())
        );
        assert_eq!(
            next_token(buf, &mut pos, b' ', true).unwrap(),
            Token::Ok("rest".into())
        );
    }

    #[test]
    fn keeps_nonmatching_inner_quote_literal() {
        let buf = r#"'he said "hi"'"#;
        let mut pos = 0;
        assert_eq!(
            next_token(buf, &mut pos, b' ', true).unwrap(),
            Token::Ok(r#"he said "hi""#.into())
        );
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        let buf = "'unterminated";
        let mut pos = 0;
        assert!(matches!(
            next_token(buf, &mut pos, b' ', true),
            Err(LexError::UnfinishedQuote(0))
        ));
    }

    #[test]
    fn blank_token_on_leading_delimiter() {
        let buf = ":second";
        let mut pos = 0;
        assert_eq!(next_token(buf, &mut pos, b':', false).unwrap(), Token::Blank);
        assert_eq!(
            next_token(buf, &mut pos, b':', false).unwrap(),
            Token::Ok("second".into())
        );
    }

    #[test]
    fn unquoted_mode_ignores_quote_chars() {
        let buf = "a:'b:c'";
        let mut pos = 0;
        assert_eq!(next_token(buf, &mut pos, b':', false).unwrap(), Token::Ok("a".into()));
        assert_eq!(
            next_token(buf, &mut pos, b':', false).unwrap(),
            Token::Ok("'b".into())
        );
    }

    #[test]
    fn next_line_skips_comments_and_blanks() {
        let data = "# a comment\n\n1:0:service:\"\":/bin/true\n";
        let mut reader = Cursor::new(data.as_bytes());
        let mut buf = String::new();
        assert_eq!(next_line(&mut reader, &mut buf).unwrap(), NextLine::Ok);
        assert_eq!(buf, "1:0:service:\"\":/bin/true");
        assert_eq!(next_line(&mut reader, &mut buf).unwrap(), NextLine::Eof);
    }

    #[test]
    fn next_line_rejects_oversized_lines() {
        let long = "a".repeat(LINE_SIZE + 1);
        let mut reader = Cursor::new(long.as_bytes());
        let mut buf = String::new();
        assert!(matches!(
            next_line(&mut reader, &mut buf),
            Err(LineError::TooBig)
        ));
    }

    #[test]
    fn next_line_accepts_boundary_length() {
        let line = "a".repeat(LINE_SIZE);
        let mut reader = Cursor::new(format!("{line}\n").into_bytes());
        let mut buf = String::new();
        assert_eq!(next_line(&mut reader, &mut buf).unwrap(), NextLine::Ok);
        assert_eq!(buf.len(), LINE_SIZE);
    }
}
