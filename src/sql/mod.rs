//! SQL front-end: tokenizer, `CREATE TABLE` parser and query validator

pub mod ddl;
pub mod lexer;
pub mod query;

pub use ddl::{parse_create_table, Column, ColumnRef, ForeignKey, TableDef};
pub use query::{validate_query, QueryShape, StatementKind};
