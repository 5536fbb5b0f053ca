//! Splits an inittab `process` field of the form
//! `[KEY=VALUE ...] /path/to/program [arg ...]` into an environment list and
//! an argv list.

use crate::lexer::{next_token, LexError, Token};
use thiserror::Error;

/// Same ceiling the original parser used for both tables; one slot is
/// implicitly reserved for the terminating NULL in the eventual `execve`.
pub const ARGS_MAX: usize = 128;
pub const ENV_MAX: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CmdlineError {
    #[error("command line is empty")]
    Empty,
    #[error("{0}")]
    Lex(#[from] LexError),
    #[error("invalid token in command line (blank or malformed quoting)")]
    InvalidToken,
    #[error("too many environment variables (max {ENV_MAX})")]
    TooManyEnv,
    #[error("too many arguments (max {ARGS_MAX})")]
    TooManyArgs,
    #[error("no program given after environment assignments")]
    NoProgram,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cmdline {
    pub env: Vec<String>,
    pub args: Vec<String>,
}

/// Parses `cmdline` into leading `KEY=VALUE` environment bindings followed
/// by a program path and its arguments. A token is treated as an
/// environment binding only as long as it contains `=`; the first token
/// without one is the program path, and nothing after that point is
/// considered for env parsing even if it happens to contain `=`.
pub fn parse(cmdline: &str) -> Result<Cmdline, CmdlineError> {
    if cmdline.is_empty() {
        return Err(CmdlineError::Empty);
    }

    let mut pos = 0usize;
    let mut env = Vec::new();
    let mut args = Vec::new();

    let program = loop {
        match next_token(cmdline, &mut pos, b' ', true)? {
            Token::Ok(tok) => {
                if tok.contains('=') {
                    if env.len() >= ENV_MAX - 1 {
                        return Err(CmdlineError::TooManyEnv);
                    }
                    env.push(tok);
                } else {
                    break tok;
                }
            }
            Token::End => return Err(CmdlineError::NoProgram),
            Token::Blank => return Err(CmdlineError::InvalidToken),
        }
    };

    args.push(program);

    loop {
        match next_token(cmdline, &mut pos, b' ', true)? {
            Token::Ok(tok) => {
                if args.len() >= ARGS_MAX - 1 {
                    return Err(CmdlineError::TooManyArgs);
                }
                args.push(tok);
            }
            Token::End => break,
            Token::Blank => return Err(CmdlineError::InvalidToken),
        }
    }

    Ok(Cmdline { env, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_env_and_args() {
        let c = parse("A=1 B='x y' /bin/p a b").unwrap();
        assert_eq!(c.env, vec!["A=1", "B=x y"]);
        assert_eq!(c.args, vec!["/bin/p", "a", "b"]);
    }

    #[test]
    fn program_with_no_env_and_no_args() {
        let c = parse("/bin/true").unwrap();
        assert!(c.env.is_empty());
        assert_eq!(c.args, vec!["/bin/true"]);
    }

    #[test]
    fn equals_sign_after_program_is_just_an_argument() {
        let c = parse("/bin/env X=1").unwrap();
        assert!(c.env.is_empty());
        assert_eq!(c.args, vec!["/bin/env", "X=1"]);
    }

    #[test]
    fn empty_command_line_is_rejected() {
        assert_eq!(parse(""), Err(CmdlineError::Empty));
    }

    #[test]
    fn only_env_bindings_with_no_program_is_rejected() {
        assert_eq!(parse("A=1 B=2"), Err(CmdlineError::NoProgram));
    }

    #[test]
    fn too_many_args_is_rejected() {
        let mut line = String::from("/bin/p");
        for i in 0..ARGS_MAX {
            line.push_str(&format!(" a{i}"));
        }
        assert_eq!(parse(&line), Err(CmdlineError::TooManyArgs));
    }

    #[test]
    fn too_many_env_is_rejected() {
        let mut line = String::new();
        for i in 0..ENV_MAX {
            line.push_str(&format!("K{i}=v "));
        }
        line.push_str("/bin/p");
        assert_eq!(parse(&line), Err(CmdlineError::TooManyEnv));
    }

    #[test]
    fn double_space_is_an_invalid_blank_token() {
        assert_eq!(parse("/bin/p  a"), Err(CmdlineError::InvalidToken));
    }
}
