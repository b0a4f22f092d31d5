//! SQL dialect translation.
//!
//! The gateway speaks Postgres-flavored SQL; the SQLite-family adapter
//! rewrites statements on the way in. Rewrites apply outside string
//! literals and quoted identifiers only, and are idempotent: translating
//! already-translated SQL is a no-op. Placeholder style is handled
//! separately by the placeholder scanner.

use once_cell::sync::Lazy;
use regex::Regex;

/// A statement split at quote boundaries. Literal segments keep their
/// quotes and are never rewritten.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Code(String),
    /// `'...'` string literal.
    Single(String),
    /// `"..."` quoted identifier.
    Double(String),
}

fn split_segments(sql: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                if !current.is_empty() {
                    segments.push(Segment::Code(std::mem::take(&mut current)));
                }
                let quote = c;
                let mut literal = String::new();
                literal.push(quote);
                while let Some(inner) = chars.next() {
                    literal.push(inner);
                    if inner == quote {
                        if chars.peek() == Some(&quote) {
                            literal.push(chars.next().unwrap());
                        } else {
                            break;
                        }
                    }
                }
                segments.push(if quote == '\'' {
                    Segment::Single(literal)
                } else {
                    Segment::Double(literal)
                });
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Code(current));
    }
    segments
}

fn join_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|segment| match segment {
            Segment::Code(text) | Segment::Single(text) | Segment::Double(text) => text.as_str(),
        })
        .collect()
}

struct Rule {
    pattern: Regex,
    replacement: &'static str,
}

impl Rule {
    fn new(pattern: &str, replacement: &'static str) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("static rule pattern"),
            replacement,
        }
    }
}

// Function and operator rewrites run before type rewrites so composite
// forms are seen intact.
static PG_TO_SQLITE: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule::new(r"(?i)\bNOW\s*\(\s*\)", "datetime('now')"),
        Rule::new(
            r"(?i)\bEXTRACT\s*\(\s*EPOCH\s+FROM\s+([^()]+?)\s*\)",
            "strftime('%s', $1)",
        ),
        Rule::new(
            r"(?i)\bGEN_RANDOM_UUID\s*\(\s*\)",
            "lower(hex(randomblob(4)) || '-' || hex(randomblob(2)) || '-' || \
             hex(randomblob(2)) || '-' || hex(randomblob(2)) || '-' || hex(randomblob(6)))",
        ),
        Rule::new(r"(?i)\bILIKE\b", "LIKE"),
        Rule::new(r"(?i)\bFETCH\s+FIRST\s+(\d+)\s+ROWS?\s+ONLY\b", "LIMIT $1"),
        Rule::new(r"(?i)\bADD\s+COLUMN\s+IF\s+NOT\s+EXISTS\b", "ADD COLUMN"),
        Rule::new(
            r"(?i)\b(?:SMALLSERIAL|BIGSERIAL|SERIAL)\s+PRIMARY\s+KEY\b",
            "INTEGER PRIMARY KEY AUTOINCREMENT",
        ),
        Rule::new(r"(?i)\b(?:VARCHAR|CHAR)\s*\(\s*\d+\s*\)", "TEXT"),
        Rule::new(r"(?i)\bTIMESTAMP\s+WITH(?:OUT)?\s+TIME\s+ZONE\b", "TEXT"),
        Rule::new(r"(?i)\bTIMESTAMPTZ\b", "TEXT"),
        Rule::new(r"(?i)\bTIMESTAMP\b", "TEXT"),
        Rule::new(r"(?i)\bTIME\b", "TEXT"),
        Rule::new(r"(?i)\bDATE\b", "TEXT"),
        Rule::new(r"(?i)\bUUID\b", "TEXT"),
        Rule::new(r"(?i)\bJSONB\b", "TEXT"),
        Rule::new(r"(?i)\bJSON\b", "TEXT"),
        Rule::new(r"(?i)\bBYTEA\b", "BLOB"),
        Rule::new(r"(?i)\bBOOLEAN\b", "INTEGER"),
        Rule::new(r"(?i)\bBIGINT\b", "INTEGER"),
        Rule::new(r"(?i)\bSMALLINT\b", "INTEGER"),
        Rule::new(r"(?i)\b(?:NUMERIC|DECIMAL)\s*\(\s*\d+\s*,\s*\d+\s*\)", "REAL"),
        Rule::new(r"(?i)\bDOUBLE\s+PRECISION\b", "REAL"),
        Rule::new(r"(?i)\bTRUE\b", "1"),
        Rule::new(r"(?i)\bFALSE\b", "0"),
    ]
});

static ANY_ARRAY_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)=\s*ANY\s*\(\s*ARRAY\s*\[").expect("static pattern"));
static ANY_ARRAY_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\]\s*\)").expect("static pattern"));
static IDENT_CAST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z_][A-Za-z_0-9]*(?:\.[A-Za-z_][A-Za-z_0-9]*)?|\d+)\s*::\s*([A-Za-z_][A-Za-z_0-9]*)")
        .expect("static pattern")
});
static LEADING_CAST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*::\s*([A-Za-z_][A-Za-z_0-9]*)").expect("static pattern")
});
static TRAILING_TILDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*~\s*$").expect("static pattern"));

static SQLITE_TO_PG: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule::new(
            r"(?i)\bINTEGER\s+PRIMARY\s+KEY\s+AUTOINCREMENT\b",
            "BIGSERIAL PRIMARY KEY",
        ),
        Rule::new(r"(?i)\bBLOB\b", "BYTEA"),
    ]
});

/// Translate Postgres-flavored SQL for a SQLite-family engine.
pub fn postgres_to_sqlite(sql: &str) -> String {
    let mut segments = split_segments(sql);

    // Rewrites that straddle a literal boundary: `col ~ 'pat'` becomes
    // `col LIKE '%pat%'`, and `'value'::type` becomes `CAST('value' AS type)`.
    rewrite_tilde_match(&mut segments);
    rewrite_literal_casts(&mut segments);

    let mut array_depth = 0usize;
    for segment in segments.iter_mut() {
        let Segment::Code(code) = segment else {
            continue;
        };
        let mut text = code.clone();

        // `= ANY(ARRAY[a, b])` → `IN (a, b)`. The closing `])` may land in
        // a later code segment when the array holds string literals.
        loop {
            let opened = ANY_ARRAY_OPEN.is_match(&text);
            if opened {
                text = ANY_ARRAY_OPEN.replace(&text, "IN (").into_owned();
                array_depth += 1;
            }
            if array_depth > 0 {
                if let Some(range) = ANY_ARRAY_CLOSE.find(&text).map(|found| found.range()) {
                    text.replace_range(range, ")");
                    array_depth -= 1;
                    continue;
                }
            }
            if !opened {
                break;
            }
        }

        text = IDENT_CAST.replace_all(&text, "CAST($1 AS $2)").into_owned();

        for rule in PG_TO_SQLITE.iter() {
            text = rule.pattern.replace_all(&text, rule.replacement).into_owned();
        }
        *code = text;
    }

    join_segments(&segments)
}

/// `col ~ 'pattern'` → `col LIKE '%pattern%'`.
fn rewrite_tilde_match(segments: &mut [Segment]) {
    for i in 0..segments.len().saturating_sub(1) {
        let tilde = match &segments[i] {
            Segment::Code(code) => TRAILING_TILDE.is_match(code),
            _ => false,
        };
        if !tilde {
            continue;
        }
        if let Segment::Single(literal) = &segments[i + 1] {
            let inner = &literal[1..literal.len() - 1];
            let wrapped = format!("'%{}%'", inner);
            if let Segment::Code(code) = &mut segments[i] {
                *code = TRAILING_TILDE.replace(code, " LIKE ").into_owned();
            }
            segments[i + 1] = Segment::Single(wrapped);
        }
    }
}

/// `'value'::type` → `CAST('value' AS type)`.
fn rewrite_literal_casts(segments: &mut Vec<Segment>) {
    let mut i = 1;
    while i < segments.len() {
        let cast = match (&segments[i - 1], &segments[i]) {
            (Segment::Single(_), Segment::Code(code)) => LEADING_CAST
                .captures(code)
                .map(|captures| (captures[1].to_string(), captures.get(0).unwrap().end())),
            _ => None,
        };
        if let Some((target_type, consumed)) = cast {
            let literal = match &segments[i - 1] {
                Segment::Single(literal) => literal.clone(),
                _ => unreachable!(),
            };
            let rest = match &segments[i] {
                Segment::Code(code) => code[consumed..].to_string(),
                _ => unreachable!(),
            };
            segments[i - 1] = Segment::Code("CAST(".to_string());
            segments.insert(i, Segment::Single(literal));
            segments[i + 1] = Segment::Code(format!(" AS {}){}", target_type, rest));
            i += 1;
        }
        i += 1;
    }
}

/// Translate SQLite-flavored SQL for a Postgres-family engine. The
/// interesting direction is the other one; this covers the schema
/// keywords that differ.
pub fn sqlite_to_postgres(sql: &str) -> String {
    let mut segments = split_segments(sql);

    // `datetime('now')` → `NOW()`, a rewrite that spans a literal.
    let mut i = 0;
    while i + 2 < segments.len() {
        let matches = matches!(
            (&segments[i], &segments[i + 1], &segments[i + 2]),
            (Segment::Code(open), Segment::Single(literal), Segment::Code(close))
                if open.to_lowercase().trim_end().ends_with("datetime(")
                    && literal == "'now'"
                    && close.trim_start().starts_with(')')
        );
        if matches {
            if let Segment::Code(open) = &mut segments[i] {
                let lower = open.to_lowercase();
                let at = lower.rfind("datetime(").unwrap();
                open.truncate(at);
                open.push_str("NOW()");
            }
            if let Segment::Code(close) = &mut segments[i + 2] {
                let trimmed = close.trim_start();
                *close = trimmed[1..].to_string();
            }
            segments.remove(i + 1);
        }
        i += 1;
    }

    for segment in segments.iter_mut() {
        let Segment::Code(code) = segment else {
            continue;
        };
        let mut text = code.clone();
        for rule in SQLITE_TO_PG.iter() {
            text = rule.pattern.replace_all(&text, rule.replacement).into_owned();
        }
        *code = text;
    }

    join_segments(&segments)
}
