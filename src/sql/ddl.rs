//! Typed parsing of `CREATE TABLE` statements
//!
//! The parser is deliberately tolerant of dialect noise (engine options,
//! defaults, check expressions) but strict about structure: one statement,
//! balanced parentheses, at least one column, unique column names, and key
//! constraints that name existing columns.

use super::lexer::{self, Token};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Target of a foreign key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    /// `None` when the DDL references the target's primary key implicitly
    pub column: Option<String>,
}

/// A column of a parsed table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub references: Option<ColumnRef>,
}

impl Column {
    pub fn is_foreign_key(&self) -> bool {
        self.references.is_some()
    }
}

/// A foreign key declared inline or as a table constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub target: ColumnRef,
}

/// Structure of one `CREATE TABLE` statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub schema: Option<String>,
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidDdl(msg.into())
}

/// Parse a single `CREATE TABLE` statement
pub fn parse_create_table(ddl: &str) -> Result<TableDef> {
    let mut tokens = lexer::tokenize(ddl).map_err(|e| invalid(e.to_string()))?;
    while tokens.last().is_some_and(|t| t.is_symbol(';')) {
        tokens.pop();
    }
    if tokens.iter().any(|t| t.is_symbol(';')) {
        return Err(invalid("expected a single CREATE TABLE statement"));
    }
    check_balanced(&tokens)?;

    let mut pos = 0;
    expect_keyword(&tokens, &mut pos, "CREATE")?;
    if eat_keyword(&tokens, &mut pos, "OR") {
        expect_keyword(&tokens, &mut pos, "REPLACE")?;
    }
    for modifier in ["GLOBAL", "LOCAL", "TEMP", "TEMPORARY", "UNLOGGED"] {
        eat_keyword(&tokens, &mut pos, modifier);
    }
    expect_keyword(&tokens, &mut pos, "TABLE")?;
    if eat_keyword(&tokens, &mut pos, "IF") {
        expect_keyword(&tokens, &mut pos, "NOT")?;
        expect_keyword(&tokens, &mut pos, "EXISTS")?;
    }

    let (schema, name) = qualified_name(&tokens, &mut pos)?;

    if !tokens.get(pos).is_some_and(|t| t.is_symbol('(')) {
        return Err(invalid(format!("expected '(' after table name {}", name)));
    }
    let close = matching_paren(&tokens, pos)?;
    let body = &tokens[pos + 1..close];

    let mut table = TableDef {
        name,
        schema,
        columns: Vec::new(),
        foreign_keys: Vec::new(),
    };
    let mut pk_columns: Vec<String> = Vec::new();

    for element in split_top_level(body) {
        if element.is_empty() {
            return Err(invalid("empty column or constraint definition"));
        }
        if is_table_constraint(element) {
            parse_table_constraint(element, &mut pk_columns, &mut table.foreign_keys)?;
        } else {
            let column = parse_column(element)?;
            if let Some(target) = &column.references {
                table.foreign_keys.push(ForeignKey {
                    column: column.name.clone(),
                    target: target.clone(),
                });
            }
            table.columns.push(column);
        }
    }

    if table.columns.is_empty() {
        return Err(invalid(format!("table {} defines no columns", table.name)));
    }

    let mut seen = HashSet::new();
    for column in &table.columns {
        if !seen.insert(column.name.to_lowercase()) {
            return Err(invalid(format!("duplicate column {}", column.name)));
        }
    }

    for pk in &pk_columns {
        let column = table
            .columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(pk))
            .ok_or_else(|| invalid(format!("primary key names unknown column {}", pk)))?;
        column.primary_key = true;
        column.nullable = false;
    }

    for fk in &table.foreign_keys {
        let column = table
            .columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(&fk.column))
            .ok_or_else(|| invalid(format!("foreign key names unknown column {}", fk.column)))?;
        if column.references.is_none() {
            column.references = Some(fk.target.clone());
        }
    }

    Ok(table)
}

fn check_balanced(tokens: &[Token]) -> Result<()> {
    let mut depth: i32 = 0;
    for t in tokens {
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
    Ok(())
}

fn eat_keyword(tokens: &[Token], pos: &mut usize, kw: &str) -> bool {
    if tokens.get(*pos).is_some_and(|t| t.is_keyword(kw)) {
        *pos += 1;
        true
    } else {
        false
    }
}

fn expect_keyword(tokens: &[Token], pos: &mut usize, kw: &str) -> Result<()> {
    if eat_keyword(tokens, pos, kw) {
        Ok(())
    } else {
        let found = tokens
            .get(*pos)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "end of input".to_string());
        Err(invalid(format!("expected {}, found {}", kw, found)))
    }
}

fn identifier(tokens: &[Token], pos: &mut usize, what: &str) -> Result<String> {
    match tokens.get(*pos).and_then(Token::identifier) {
        Some(id) if !id.is_empty() => {
            *pos += 1;
            Ok(id.to_string())
        }
        _ => Err(invalid(format!("expected {}", what))),
    }
}

fn qualified_name(tokens: &[Token], pos: &mut usize) -> Result<(Option<String>, String)> {
    let mut parts = vec![identifier(tokens, pos, "table name")?];
    while tokens.get(*pos).is_some_and(|t| t.is_symbol('.')) {
        *pos += 1;
        parts.push(identifier(tokens, pos, "table name after '.'")?);
    }
    let name = parts.pop().unwrap_or_default();
    let schema = if parts.is_empty() {
        None
    } else {
        Some(parts.join("."))
    };
    Ok((schema, name))
}

/// Index of the `)` closing the `(` at `open`
fn matching_paren(tokens: &[Token], open: usize) -> Result<usize> {
    let mut depth = 0;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        if t.is_symbol('(') {
            depth += 1;
        } else if t.is_symbol(')') {
            depth -= 1;
            if depth == 0 {
                return Ok(i);
            }
        }
    }
    Err(invalid("unbalanced '('"))
}

fn split_top_level(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (i, t) in tokens.iter().enumerate() {
        if t.is_symbol('(') {
            depth += 1;
        } else if t.is_symbol(')') {
            depth -= 1;
        } else if t.is_symbol(',') && depth == 0 {
            parts.push(&tokens[start..i]);
            start = i + 1;
        }
    }
    parts.push(&tokens[start..]);
    parts
}

fn is_table_constraint(element: &[Token]) -> bool {
    let first = &element[0];
    let second = element.get(1);
    let opens_list = |t: Option<&Token>| t.is_some_and(|t| t.is_symbol('('));

    if first.is_keyword("CONSTRAINT") || first.is_keyword("EXCLUDE") {
        return true;
    }
    if first.is_keyword("PRIMARY") || first.is_keyword("FOREIGN") {
        return second.is_some_and(|t| t.is_keyword("KEY"));
    }
    if first.is_keyword("UNIQUE") || first.is_keyword("CHECK") {
        return opens_list(second)
            || second.is_some_and(|t| t.is_keyword("KEY") || t.is_keyword("INDEX"));
    }
    if ["KEY", "INDEX", "FULLTEXT", "SPATIAL"]
        .iter()
        .any(|kw| first.is_keyword(kw))
    {
        return opens_column_list(element);
    }
    false
}

/// True when the first parenthesised list after the leading keyword names
/// columns, as in `KEY idx (a, b)`, rather than type arguments such as the
/// `(64)` of a column called `key VARCHAR(64)`
fn opens_column_list(element: &[Token]) -> bool {
    let Some(open) = element
        .iter()
        .skip(1)
        .take(4)
        .position(|t| t.identifier().is_none())
        .map(|i| i + 1)
    else {
        return false;
    };
    if !element[open].is_symbol('(') {
        return false;
    }
    let Ok(close) = matching_paren(element, open) else {
        return false;
    };
    let inner = &element[open + 1..close];
    !inner.is_empty()
        && split_top_level(inner)
            .iter()
            .all(|part| part.first().is_some_and(|t| t.identifier().is_some()))
}

fn paren_identifiers(tokens: &[Token], pos: &mut usize) -> Result<Vec<String>> {
    if !tokens.get(*pos).is_some_and(|t| t.is_symbol('(')) {
        return Err(invalid("expected column list"));
    }
    let close = matching_paren(tokens, *pos)?;
    let mut names = Vec::new();
    for part in split_top_level(&tokens[*pos + 1..close]) {
        match part.first().and_then(Token::identifier) {
            Some(id) => names.push(id.to_string()),
            None => return Err(invalid("expected column name in list")),
        }
    }
    *pos = close + 1;
    Ok(names)
}

fn parse_references(tokens: &[Token], pos: &mut usize) -> Result<Vec<ColumnRef>> {
    let (_, table) = qualified_name(tokens, pos)?;
    if tokens.get(*pos).is_some_and(|t| t.is_symbol('(')) {
        let columns = paren_identifiers(tokens, pos)?;
        Ok(columns
            .into_iter()
            .map(|c| ColumnRef {
                table: table.clone(),
                column: Some(c),
            })
            .collect())
    } else {
        Ok(vec![ColumnRef {
            table,
            column: None,
        }])
    }
}

fn parse_table_constraint(
    element: &[Token],
    pk_columns: &mut Vec<String>,
    foreign_keys: &mut Vec<ForeignKey>,
) -> Result<()> {
    let mut pos = 0;
    if eat_keyword(element, &mut pos, "CONSTRAINT") {
        identifier(element, &mut pos, "constraint name")?;
    }

    if eat_keyword(element, &mut pos, "PRIMARY") {
        expect_keyword(element, &mut pos, "KEY")?;
        pk_columns.extend(paren_identifiers(element, &mut pos)?);
    } else if eat_keyword(element, &mut pos, "FOREIGN") {
        expect_keyword(element, &mut pos, "KEY")?;
        let columns = paren_identifiers(element, &mut pos)?;
        expect_keyword(element, &mut pos, "REFERENCES")?;
        let targets = parse_references(element, &mut pos)?;

        if targets.len() > 1 && targets.len() != columns.len() {
            return Err(invalid("foreign key column counts differ"));
        }
        for (i, column) in columns.into_iter().enumerate() {
            let target = targets.get(i).unwrap_or(&targets[0]).clone();
            foreign_keys.push(ForeignKey { column, target });
        }
    }
    Ok(())
}

const COLUMN_CONSTRAINTS: &[&str] = &[
    "AUTOINCREMENT",
    "AUTO_INCREMENT",
    "CHECK",
    "COLLATE",
    "COMMENT",
    "CONSTRAINT",
    "DEFAULT",
    "GENERATED",
    "IDENTITY",
    "NOT",
    "NULL",
    "ON",
    "PRIMARY",
    "REFERENCES",
    "UNIQUE",
];

fn is_column_constraint(token: &Token) -> bool {
    COLUMN_CONSTRAINTS.iter().any(|kw| token.is_keyword(kw))
}

fn parse_column(element: &[Token]) -> Result<Column> {
    let mut pos = 0;
    let name = identifier(element, &mut pos, "column name")?;

    let mut data_type = String::new();
    while let Some(token) = element.get(pos) {
        if is_column_constraint(token) {
            break;
        }
        match token {
            Token::Symbol('(') => {
                let close = matching_paren(element, pos)?;
                let args: Vec<String> = element[pos + 1..close].iter().map(|t| t.to_string()).collect();
                data_type.push('(');
                data_type.push_str(&args.join(""));
                data_type.push(')');
                pos = close + 1;
                continue;
            }
            Token::Quoted(q) if q.is_empty() => data_type.push_str("[]"),
            Token::Word(w) => {
                if !data_type.is_empty() {
                    data_type.push(' ');
                }
                data_type.push_str(w);
            }
            other => {
                return Err(invalid(format!(
                    "unexpected {} in type of column {}",
                    other, name
                )))
            }
        }
        pos += 1;
    }
    if data_type.is_empty() {
        return Err(invalid(format!("column {} has no data type", name)));
    }

    let mut column = Column {
        name,
        data_type,
        nullable: true,
        primary_key: false,
        references: None,
    };

    while let Some(token) = element.get(pos) {
        if token.is_keyword("NOT") && element.get(pos + 1).is_some_and(|t| t.is_keyword("NULL")) {
            column.nullable = false;
            pos += 2;
        } else if token.is_keyword("PRIMARY")
            && element.get(pos + 1).is_some_and(|t| t.is_keyword("KEY"))
        {
            column.primary_key = true;
            column.nullable = false;
            pos += 2;
        } else if token.is_keyword("REFERENCES") {
            pos += 1;
            let targets = parse_references(element, &mut pos)?;
            column.references = targets.into_iter().next();
        } else if token.is_symbol('(') {
            pos = matching_paren(element, pos)? + 1;
        } else {
            pos += 1;
        }
    }

    Ok(column)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAULT_LOG: &str = r#"CREATE TABLE `Fault_Log` (
`fault_log_entry_id` INTEGER PRIMARY KEY,
`asset_id` INTEGER NOT NULL,
`recorded_by_staff_id` INTEGER NOT NULL,
`fault_log_entry_datetime` DATETIME,
`fault_description` VARCHAR(255),
`other_fault_details` VARCHAR(255),
FOREIGN KEY (`asset_id` ) REFERENCES `Assets`(`asset_id` ),
FOREIGN KEY (`recorded_by_staff_id` ) REFERENCES `Staff`(`staff_id` )
);"#;

    #[test]
    fn test_parse_fixture_table() {
        let table = parse_create_table(FAULT_LOG).unwrap();
        assert_eq!(table.name, "Fault_Log");
        assert_eq!(table.columns.len(), 6);

        let id = table.column("fault_log_entry_id").unwrap();
        assert!(id.primary_key);
        assert!(!id.nullable);

        let asset = table.column("asset_id").unwrap();
        assert_eq!(asset.data_type, "INTEGER");
        assert!(!asset.nullable);
        assert_eq!(
            asset.references,
            Some(ColumnRef {
                table: "Assets".to_string(),
                column: Some("asset_id".to_string())
            })
        );

        assert_eq!(table.column("fault_description").unwrap().data_type, "VARCHAR(255)");
        assert_eq!(table.foreign_keys.len(), 2);
        assert_eq!(table.foreign_keys[1].target.table, "Staff");
    }

    #[test]
    fn test_postgres_style() {
        let ddl = "CREATE TABLE IF NOT EXISTS public.orders (
            id BIGSERIAL,
            customer_id INT REFERENCES customers,
            total NUMERIC(10, 2) DEFAULT 0 CHECK (total >= 0),
            placed_at TIMESTAMP WITH TIME ZONE NOT NULL,
            tags TEXT[],
            CONSTRAINT orders_pk PRIMARY KEY (id)
        )";
        let table = parse_create_table(ddl).unwrap();
        assert_eq!(table.schema.as_deref(), Some("public"));
        assert_eq!(table.name, "orders");
        assert!(table.column("id").unwrap().primary_key);
        assert_eq!(table.column("total").unwrap().data_type, "NUMERIC(10,2)");
        assert_eq!(
            table.column("placed_at").unwrap().data_type,
            "TIMESTAMP WITH TIME ZONE"
        );
        assert_eq!(table.column("tags").unwrap().data_type, "TEXT[]");

        let fk = &table.foreign_keys[0];
        assert_eq!(fk.column, "customer_id");
        assert_eq!(fk.target.table, "customers");
        assert_eq!(fk.target.column, None);
    }

    #[test]
    fn test_mysql_options_and_keys() {
        let ddl = "CREATE TABLE t (
            id INT NOT NULL AUTO_INCREMENT,
            name VARCHAR(64) COMMENT 'display name',
            PRIMARY KEY (id),
            KEY idx_name (name),
            UNIQUE KEY uq_name (name)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;";
        let table = parse_create_table(ddl).unwrap();
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.primary_key().len(), 1);
    }

    #[test]
    fn test_key_and_index_columns() {
        let table =
            parse_create_table("CREATE TABLE settings (key VARCHAR(64) NOT NULL, value TEXT)")
                .unwrap();
        let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["key", "value"]);
        let key = table.column("key").unwrap();
        assert_eq!(key.data_type, "VARCHAR(64)");
        assert!(!key.nullable);

        let table = parse_create_table("CREATE TABLE t (index INT(11))").unwrap();
        assert_eq!(table.columns.len(), 1);
        assert_eq!(table.columns[0].name, "index");
        assert_eq!(table.columns[0].data_type, "INT(11)");

        let table = parse_create_table(
            "CREATE TABLE docs (
                id INT,
                body TEXT,
                INDEX idx_id USING BTREE (id),
                FULLTEXT KEY ft_body (body)
            )",
        )
        .unwrap();
        assert_eq!(table.columns.len(), 2);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "SELECT * FROM t",
            "CREATE TABLE t",
            "CREATE TABLE t (",
            "CREATE TABLE t ()",
            "CREATE TABLE t (id INT,, name TEXT)",
            "CREATE TABLE t (id)",
            "CREATE TABLE t (id INT, ID TEXT)",
            "CREATE TABLE t (id INT, PRIMARY KEY (missing))",
            "CREATE TABLE t (id INT, FOREIGN KEY (nope) REFERENCES u(id))",
            "CREATE TABLE t (id INT); CREATE TABLE u (id INT)",
            "CREATE TABLE t (id INT))",
        ] {
            let err = parse_create_table(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidDdl(_)), "accepted: {bad:?}");
        }
    }
}
