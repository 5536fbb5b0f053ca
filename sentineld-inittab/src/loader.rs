//! Reads a complete inittab file into an [`InittabSet`].

use crate::entry::{EntryType, InittabEntry, CTTY_PATH_MAX, PROCESS_NAME_MAX};
use crate::list::insert_stable;
use sentineld_cmdline::lexer::{next_line, next_token, LineError, NextLine, Token};
use std::io::BufRead;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InittabSet {
    pub startup_list: Vec<InittabEntry>,
    pub shutdown_list: Vec<InittabEntry>,
    pub safe_mode_entry: Option<InittabEntry>,
}

#[derive(Debug, Error)]
pub enum InittabError {
    #[error("could not open inittab file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} malformed line(s) found while reading inittab")]
    MalformedLines(usize),
    #[error("no <safe-mode> entry present in inittab")]
    MissingSafeMode,
    #[error("more than one <safe-mode> entry present in inittab")]
    DuplicateSafeMode,
}

#[derive(Debug, Error, PartialEq, Eq)]
enum LineParseError {
    #[error("invalid 'order' field")]
    Order,
    #[error("invalid 'core_id' field")]
    CoreId,
    #[error("invalid or missing 'type' field")]
    Type,
    #[error("'order' field is required for every type other than <safe-mode>")]
    OrderRequired,
    #[error("invalid 'controlling-terminal' field")]
    Ctty,
    #[error("invalid or missing 'process' field")]
    Process,
}

fn parse_i32_field(tok: &str) -> Option<u32> {
    let v: i64 = tok.parse().ok()?;
    if v < 0 || v > i32::MAX as i64 {
        None
    } else {
        Some(v as u32)
    }
}

fn parse_line(line: &str) -> Result<InittabEntry, LineParseError> {
    let mut pos = 0usize;

    let order = match next_token(line, &mut pos, b':', false) {
        Ok(Token::Blank) => None,
        Ok(Token::Ok(tok)) => Some(parse_i32_field(&tok).ok_or(LineParseError::Order)?),
        _ => return Err(LineParseError::Order),
    };

    let core_id = match next_token(line, &mut pos, b':', false) {
        Ok(Token::Blank) => None,
        Ok(Token::Ok(tok)) => Some(parse_i32_field(&tok).ok_or(LineParseError::CoreId)?),
        _ => return Err(LineParseError::CoreId),
    };

    let entry_type = match next_token(line, &mut pos, b':', false) {
        Ok(Token::Ok(tok)) => EntryType::from_tag(&tok).ok_or(LineParseError::Type)?,
        _ => return Err(LineParseError::Type),
    };

    if order.is_none() && entry_type != EntryType::SafeMode {
        return Err(LineParseError::OrderRequired);
    }

    let ctty_path = match next_token(line, &mut pos, b':', false) {
        Ok(Token::Blank) => String::new(),
        Ok(Token::Ok(tok)) if tok.len() <= CTTY_PATH_MAX => tok,
        _ => return Err(LineParseError::Ctty),
    };

    let process_name = match next_token(line, &mut pos, 0, false) {
        Ok(Token::Ok(tok)) if tok.len() <= PROCESS_NAME_MAX => tok,
        _ => return Err(LineParseError::Process),
    };

    Ok(InittabEntry {
        order,
        core_id,
        entry_type,
        ctty_path,
        process_name,
    })
}

/// Loads and validates an entire inittab file. Every line is attempted
/// even after an earlier one fails, so a single pass surfaces every
/// malformed line in the log; the load as a whole still fails if any
/// line was rejected, the safe-mode entry is missing, or a second one
/// was found.
pub fn load(path: &Path) -> Result<InittabSet, InittabError> {
    let file = std::fs::File::open(path).map_err(|source| InittabError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = std::io::BufReader::new(file);
    read_from(&mut reader)
}

pub fn read_from<R: BufRead>(reader: &mut R) -> Result<InittabSet, InittabError> {
    let mut set = InittabSet::default();
    let mut malformed = 0usize;
    let mut line = String::new();

    loop {
        match next_line(reader, &mut line) {
            Ok(NextLine::Eof) => break,
            Err(LineError::TooBig) => {
                tracing::error!("inittab line exceeds the line-length limit, skipping");
                malformed += 1;
                continue;
            }
            Err(LineError::Io(e)) => {
                tracing::error!(error = %e, "i/o error reading inittab, aborting read");
                malformed += 1;
                break;
            }
            Ok(NextLine::Ok) => {}
        }

        match parse_line(&line) {
            Ok(entry) => {
                if !place_entry(&mut set, entry) {
                    // A second <safe-mode> entry is unrecoverable: unlike an
                    // ordinary malformed line, the source stops reading
                    // immediately rather than accumulating further errors.
                    return Err(InittabError::DuplicateSafeMode);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, line = %line, "malformed inittab entry");
                malformed += 1;
            }
        }
    }

    if malformed > 0 {
        return Err(InittabError::MalformedLines(malformed));
    }
    if set.safe_mode_entry.is_none() {
        return Err(InittabError::MissingSafeMode);
    }

    tracing::info!(
        startup = set.startup_list.len(),
        shutdown = set.shutdown_list.len(),
        "inittab loaded"
    );
    Ok(set)
}

/// Returns `false` only for an unrecoverable duplicate `<safe-mode>` entry.
fn place_entry(set: &mut InittabSet, entry: InittabEntry) -> bool {
    match entry.entry_type {
        EntryType::OneShot | EntryType::SafeOneShot | EntryType::Service | EntryType::SafeService => {
            insert_stable(&mut set.startup_list, entry);
        }
        EntryType::Shutdown | EntryType::SafeShutdown => {
            insert_stable(&mut set.shutdown_list, entry);
        }
        EntryType::SafeMode => {
            if set.safe_mode_entry.is_some() {
                tracing::error!("a <safe-mode> entry was already defined");
                return false;
            }
            set.safe_mode_entry = Some(entry);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read(s: &str) -> Result<InittabSet, InittabError> {
        let mut c = Cursor::new(s.as_bytes().to_vec());
        read_from(&mut c)
    }

    #[test]
    fn parses_a_minimal_valid_table() {
        let set = read(
            "1:0:<one-shot>::echo hi\n\
             1::<service>::sleep 3600\n\
             ::<safe-mode>::/bin/recover\n",
        )
        .unwrap();
        assert_eq!(set.startup_list.len(), 2);
        assert!(set.safe_mode_entry.is_some());
        assert!(set.shutdown_list.is_empty());
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let set = read(
            "# comment\n\n::<safe-mode>::/bin/recover\n",
        )
        .unwrap();
        assert!(set.safe_mode_entry.is_some());
    }

    #[test]
    fn missing_safe_mode_entry_fails() {
        let err = read("1:0:<one-shot>::echo hi\n").unwrap_err();
        assert!(matches!(err, InittabError::MissingSafeMode));
    }

    #[test]
    fn duplicate_safe_mode_entry_fails() {
        let err = read(
            "::<safe-mode>::/bin/a\n::<safe-mode>::/bin/b\n",
        )
        .unwrap_err();
        assert!(matches!(err, InittabError::DuplicateSafeMode));
    }

    #[test]
    fn blank_order_on_non_safe_mode_entry_fails() {
        let err = read(":0:<service>::sleep 3600\n::<safe-mode>::/bin/recover\n").unwrap_err();
        assert!(matches!(err, InittabError::MalformedLines(1)));
    }

    #[test]
    fn waves_are_stably_ordered_across_lines() {
        let set = read(
            "2:0:<service>::/bin/second\n\
             1:0:<one-shot>::/bin/first\n\
             2:0:<service>::/bin/second-tie\n\
             ::<safe-mode>::/bin/recover\n",
        )
        .unwrap();
        let names: Vec<&str> = set
            .startup_list
            .iter()
            .map(|e| e.process_name.as_str())
            .collect();
        assert_eq!(names, vec!["/bin/first", "/bin/second", "/bin/second-tie"]);
    }
}
