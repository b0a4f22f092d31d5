//! Placeholder rewriting.
//!
//! The gateway accepts `$n` and `?` placeholders interchangeably. Each
//! adapter rewrites to its engine's native style with a single-pass
//! scanner that tracks quote state, so text inside string literals and
//! quoted identifiers is never touched. `''` and `""` are escapes.

use super::error::Error;
use super::EngineKind;
use crate::net::Datum;

#[derive(Debug, Clone, Copy, PartialEq)]
enum QuoteState {
    Code,
    Single,
    Double,
}

/// Rewrite placeholders for the target engine and bind parameters in the
/// order the engine will see them.
///
/// `$0` is a hard error. A `$n` beyond the supplied parameters is
/// [`Error::MissingParam`]; supplied parameters that no placeholder
/// references are simply not bound.
pub fn bind_placeholders(
    sql: &str,
    params: &[Datum],
    target: EngineKind,
) -> Result<(String, Vec<Datum>), Error> {
    let mut output = String::with_capacity(sql.len());
    let mut bound: Vec<Datum> = Vec::with_capacity(params.len());
    let mut state = QuoteState::Code;
    // Next positional parameter for `?` placeholders.
    let mut positional = 0usize;
    // Next number for `?` → `$n` rewriting.
    let mut dollar_counter = 0usize;

    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            QuoteState::Single => {
                output.push(c);
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        output.push(chars.next().unwrap());
                    } else {
                        state = QuoteState::Code;
                    }
                }
            }
            QuoteState::Double => {
                output.push(c);
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        output.push(chars.next().unwrap());
                    } else {
                        state = QuoteState::Code;
                    }
                }
            }
            QuoteState::Code => match c {
                '\'' => {
                    state = QuoteState::Single;
                    output.push(c);
                }
                '"' => {
                    state = QuoteState::Double;
                    output.push(c);
                }
                '$' if chars.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                    let mut digits = String::new();
                    while chars.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                        digits.push(chars.next().unwrap());
                    }
                    let index: usize = digits
                        .parse()
                        .map_err(|_| Error::InvalidPlaceholder(format!("${}", digits)))?;
                    if index == 0 {
                        return Err(Error::InvalidPlaceholder("$0".into()));
                    }
                    if index > params.len() {
                        return Err(Error::MissingParam(index));
                    }
                    match target {
                        EngineKind::Postgres => {
                            output.push('$');
                            output.push_str(&digits);
                        }
                        EngineKind::Sqlite => {
                            output.push('?');
                            bound.push(params[index - 1].clone());
                        }
                    }
                }
                '?' => {
                    positional += 1;
                    if positional > params.len() {
                        return Err(Error::MissingParam(positional));
                    }
                    match target {
                        EngineKind::Postgres => {
                            dollar_counter += 1;
                            output.push('$');
                            output.push_str(&dollar_counter.to_string());
                        }
                        EngineKind::Sqlite => {
                            output.push('?');
                            bound.push(params[positional - 1].clone());
                        }
                    }
                }
                other => output.push(other),
            },
        }
    }

    if target == EngineKind::Postgres {
        bound = params.to_vec();
    }

    Ok((output, bound))
}
