//! Quoting of identifiers and other fragments that cannot be parameter-bound.
//!
//! Table, column, role and type names have to be spliced into statement text.
//! Every such splice goes through this module: identifiers are always
//! double-quoted, literals single-quoted, bodies dollar-quoted, and the few
//! keyword or type positions are checked against a whitelist.

use crate::error::ToolError;
use once_cell::sync::Lazy;
use regex::Regex;

/// PostgreSQL truncates identifiers at `NAMEDATALEN - 1` bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Type expressions: a (possibly qualified or quoted) name, an optional
/// precision list, an optional time zone clause and array suffixes.
static TYPE_EXPR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)^(?:"[^"\x00]+"|[a-z_][a-z0-9_$]*)(?:\.(?:"[^"\x00]+"|[a-z_][a-z0-9_$]*))?(?:\s+[a-z_][a-z0-9_]*)*(?:\s*\(\s*\d+\s*(?:,\s*\d+\s*)?\))?(?:\s+(?:with|without)\s+time\s+zone)?(?:\s*\[\d*\])*$"#,
    )
    .expect("Invalid regex: type expression pattern")
});

/// Quotes one identifier.
///
/// Empty names, names containing NUL, and names over 63 bytes are rejected.
/// Embedded double quotes are doubled.
pub fn quote_ident(name: &str) -> Result<String, ToolError> {
    if name.is_empty() {
        return Err(ToolError::invalid("Identifier cannot be empty"));
    }
    if name.contains('\0') {
        return Err(ToolError::invalid(format!(
            "Invalid identifier '{}': contains a NUL character",
            name.escape_default()
        )));
    }
    if name.len() > MAX_IDENTIFIER_BYTES {
        return Err(ToolError::invalid(format!(
            "Invalid identifier '{}': longer than {} bytes",
            name, MAX_IDENTIFIER_BYTES
        )));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quotes `schema.name`.
pub fn quote_qualified(schema: &str, name: &str) -> Result<String, ToolError> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(name)?))
}

/// Quotes every name and joins them with `, `.
pub fn quote_ident_list<S: AsRef<str>>(names: &[S]) -> Result<String, ToolError> {
    if names.is_empty() {
        return Err(ToolError::invalid("Identifier list cannot be empty"));
    }
    names
        .iter()
        .map(|name| quote_ident(name.as_ref()))
        .collect::<Result<Vec<_>, _>>()
        .map(|quoted| quoted.join(", "))
}

/// Single-quotes a string literal.
pub fn quote_literal(value: &str) -> Result<String, ToolError> {
    if value.contains('\0') {
        return Err(ToolError::invalid("String literal contains a NUL character"));
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

/// Dollar-quotes a body with a tag that does not occur inside it.
///
/// A body ending in a prefix of the tag (`...$body`) would close early once the
/// tag is appended, so the tag must first appear exactly where it is appended.
pub fn dollar_quote(body: &str) -> String {
    let mut tag = String::from("$body$");
    let mut n = 0;
    while format!("{body}{tag}").find(&tag) != Some(body.len()) {
        n += 1;
        tag = format!("$body{}$", n);
    }
    format!("{tag}{body}{tag}")
}

/// Checks a data type expression such as `varchar(255)`, `numeric(10, 2)`,
/// `timestamp with time zone` or `public.mood[]`.
pub fn validate_type_expr(expr: &str) -> Result<&str, ToolError> {
    let trimmed = expr.trim();
    if TYPE_EXPR_REGEX.is_match(trimmed) {
        Ok(trimmed)
    } else {
        Err(ToolError::invalid(format!(
            "Invalid data type '{}'",
            expr
        )))
    }
}

/// Where the fragment scanner is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    Code,
    Literal { escapes: bool },
    QuotedIdent,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Checks a caller-written SQL expression (policy predicate, index predicate,
/// check constraint, column default, filter clause) before it is spliced in.
///
/// The fragment must stay a single expression: no statement separators, no
/// comments, balanced parentheses, and closed string literals and quoted
/// identifiers. `E'...'` literals honour backslash escapes.
pub fn validate_fragment<'a>(field: &str, fragment: &'a str) -> Result<&'a str, ToolError> {
    let trimmed = fragment.trim();
    let reject = |reason: &str| ToolError::invalid(format!("Invalid {}: {}", field, reason));

    if trimmed.is_empty() {
        return Err(reject("expression is empty"));
    }
    if trimmed.contains('\0') {
        return Err(reject("contains a NUL character"));
    }

    let mut depth: i32 = 0;
    let mut state = Lexeme::Code;
    let mut previous: Option<char> = None;
    let mut before_previous: Option<char> = None;
    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            Lexeme::Literal { escapes } => match c {
                '\\' if escapes => {
                    chars.next();
                }
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                }
                '\'' => state = Lexeme::Code,
                _ => {}
            },
            Lexeme::QuotedIdent => match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                }
                '"' => state = Lexeme::Code,
                _ => {}
            },
            Lexeme::Code => match c {
                '\'' => {
                    // E'...' takes backslash escapes; `xE'` is an identifier followed by a literal
                    let escapes = previous.is_some_and(|p| p.eq_ignore_ascii_case(&'e'))
                        && !before_previous.is_some_and(is_ident_char);
                    state = Lexeme::Literal { escapes };
                }
                '"' => state = Lexeme::QuotedIdent,
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(reject("unbalanced parentheses"));
                    }
                }
                ';' => return Err(reject("statement separators are not allowed")),
                '-' if chars.peek() == Some(&'-') => return Err(reject("comments are not allowed")),
                '/' if chars.peek() == Some(&'*') => return Err(reject("comments are not allowed")),
                '$' if chars.peek().is_some_and(|next| !next.is_ascii_digit()) => {
                    return Err(reject("dollar quoting is not allowed"));
                }
                _ => {}
            },
        }
        before_previous = previous;
        previous = Some(c);
    }

    match state {
        Lexeme::Literal { .. } => return Err(reject("unterminated string literal")),
        Lexeme::QuotedIdent => return Err(reject("unterminated quoted identifier")),
        Lexeme::Code => {}
    }
    if depth != 0 {
        return Err(reject("unbalanced parentheses"));
    }
    Ok(trimmed)
}

/// Checks one caller-written statement: a single trailing `;` is dropped,
/// anything else follows the [`validate_fragment`] rules.
pub fn validate_statement<'a>(field: &str, sql: &'a str) -> Result<&'a str, ToolError> {
    let trimmed = sql.trim();
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
    validate_fragment(field, body)
}

/// Matches `value` case-insensitively against `allowed` and returns the allowed spelling.
pub fn validate_keyword(
    field: &str,
    value: &str,
    allowed: &[&'static str],
) -> Result<&'static str, ToolError> {
    let normalized = value.trim();
    allowed
        .iter()
        .find(|candidate| candidate.eq_ignore_ascii_case(normalized))
        .copied()
        .ok_or_else(|| {
            ToolError::invalid(format!(
                "Invalid {} '{}'. Expected one of: {}",
                field,
                value,
                allowed.join(", ")
            ))
        })
}
