//! Syntactic validation of example queries

use super::lexer::{self, Token};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Leading keyword of a validated statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

/// What validation learned about a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryShape {
    pub kind: StatementKind,
    /// Tables named after FROM / JOIN / INTO / UPDATE, minus CTE names, deduplicated
    pub referenced_tables: Vec<String>,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidQuery(msg.into())
}

/// Check that `sql` is a single, well-formed DML statement
pub fn validate_query(sql: &str) -> Result<QueryShape> {
    let mut tokens = lexer::tokenize(sql).map_err(|e| invalid(e.to_string()))?;
    while tokens.last().is_some_and(|t| t.is_symbol(';')) {
        tokens.pop();
    }
    if tokens.is_empty() {
        return Err(invalid("query is empty"));
    }
    if tokens.iter().any(|t| t.is_symbol(';')) {
        return Err(invalid("expected a single statement"));
    }

    let mut depth: i32 = 0;
    for t in &tokens {
        if t.is_symbol('(') {
            depth += 1;
        } else if t.is_symbol(')') {
            depth -= 1;
            if depth < 0 {
                return Err(invalid("unbalanced ')'"));
            }
        }
    }
    if depth != 0 {
        return Err(invalid("unbalanced '('"));
    }

    let kind = statement_kind(&tokens)?;
    if kind == StatementKind::Select && !tokens.iter().any(|t| t.is_keyword("SELECT")) {
        return Err(invalid("WITH clause without a SELECT"));
    }
    if tokens.len() < 2 {
        return Err(invalid("incomplete statement"));
    }

    let ctes = cte_names(&tokens);
    let mut referenced: Vec<String> = Vec::new();
    for (i, t) in tokens.iter().enumerate() {
        let introduces_table = (t.is_keyword("FROM") && !is_expression_from(&tokens, i))
            || t.is_keyword("JOIN")
            || t.is_keyword("INTO")
            || (t.is_keyword("UPDATE") && i == 0);
        if !introduces_table {
            continue;
        }
        if let Some(name) = table_after(&tokens, i)? {
            let known_cte = ctes.iter().any(|c| c.eq_ignore_ascii_case(&name));
            let seen = referenced.iter().any(|r| r.eq_ignore_ascii_case(&name));
            if !known_cte && !seen {
                referenced.push(name);
            }
        }
    }

    Ok(QueryShape {
        kind,
        referenced_tables: referenced,
    })
}

fn statement_kind(tokens: &[Token]) -> Result<StatementKind> {
    let mut first = 0;
    while tokens.get(first).is_some_and(|t| t.is_symbol('(')) {
        first += 1;
    }
    match tokens.get(first) {
        Some(t) if t.is_keyword("SELECT") || t.is_keyword("WITH") => Ok(StatementKind::Select),
        Some(t) if t.is_keyword("INSERT") => Ok(StatementKind::Insert),
        Some(t) if t.is_keyword("UPDATE") => Ok(StatementKind::Update),
        Some(t) if t.is_keyword("DELETE") => Ok(StatementKind::Delete),
        Some(t) => Err(invalid(format!("unsupported statement starting with {}", t))),
        None => Err(invalid("query is empty")),
    }
}

/// Names bound by `WITH name AS (...)`
fn cte_names(tokens: &[Token]) -> Vec<String> {
    let mut names = Vec::new();
    for window in tokens.windows(3) {
        if let (Some(name), true, true) = (
            window[0].identifier(),
            window[1].is_keyword("AS"),
            window[2].is_symbol('('),
        ) {
            names.push(name.to_string());
        }
    }
    names
}

/// FROM used inside an expression: `EXTRACT(YEAR FROM d)`, `SUBSTRING(s FROM 2)`,
/// `a IS DISTINCT FROM b`
fn is_expression_from(tokens: &[Token], at: usize) -> bool {
    if at > 0 && tokens[at - 1].is_keyword("DISTINCT") {
        return true;
    }
    let mut depth = 0;
    for j in (0..at).rev() {
        if tokens[j].is_symbol(')') {
            depth += 1;
        } else if tokens[j].is_symbol('(') {
            if depth > 0 {
                depth -= 1;
                continue;
            }
            let called = j > 0 && matches!(tokens[j - 1], Token::Word(_));
            let subquery = tokens
                .get(j + 1)
                .is_some_and(|t| t.is_keyword("SELECT") || t.is_keyword("WITH"));
            return called && !subquery;
        }
    }
    false
}

/// Table named after the keyword at `at`
///
/// `Ok(None)` for subqueries and table functions; an error when the keyword
/// is followed by nothing, punctuation, a literal or another clause.
fn table_after(tokens: &[Token], at: usize) -> Result<Option<String>> {
    let keyword = &tokens[at];
    let missing = || invalid(format!("expected a table after {}", keyword));
    let mut pos = at + 1;
    let first = tokens.get(pos).ok_or_else(missing)?;
    match first {
        Token::Symbol('(') => return Ok(None),
        Token::Word(w) if is_clause_keyword(w) => return Err(missing()),
        Token::Word(w) if is_table_modifier(w) => return Ok(None),
        Token::Word(_) | Token::Quoted(_) => {}
        _ => return Err(missing()),
    }

    let mut name = first.identifier().unwrap_or_default().to_string();
    while tokens.get(pos + 1).is_some_and(|t| t.is_symbol('.')) {
        pos += 2;
        name = tokens
            .get(pos)
            .and_then(Token::identifier)
            .ok_or_else(|| invalid(format!("incomplete table name {}.", name)))?
            .to_string();
    }

    let is_call = tokens.get(pos + 1).is_some_and(|t| t.is_symbol('('));
    if is_call && !keyword.is_keyword("INTO") {
        return Ok(None);
    }
    Ok(Some(name))
}

fn is_table_modifier(word: &str) -> bool {
    ["LATERAL", "UNNEST", "ONLY"]
        .iter()
        .any(|kw| word.eq_ignore_ascii_case(kw))
}

const CLAUSE_KEYWORDS: &[&str] = &[
    "AND", "AS", "CROSS", "EXCEPT", "FROM", "FULL", "GROUP", "HAVING", "INNER", "INTERSECT",
    "JOIN", "LEFT", "LIMIT", "NATURAL", "OFFSET", "ON", "OR", "ORDER", "OUTER", "RETURNING",
    "RIGHT", "SELECT", "SET", "UNION", "USING", "VALUES", "WHERE", "WINDOW", "WITH",
];

fn is_clause_keyword(word: &str) -> bool {
    CLAUSE_KEYWORDS.iter().any(|kw| word.eq_ignore_ascii_case(kw))
}
