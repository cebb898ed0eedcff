use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::ActorId;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        capacity: u32,
        name: Option<String>,
    },
    /// Resources are never dropped; DELETE turns one off.
    DeactivateResource {
        id: Ulid,
    },
    Join {
        resource_id: Ulid,
        actor_id: ActorId,
    },
    Leave {
        resource_id: Ulid,
        actor_id: ActorId,
    },
    JoinWaitlist {
        resource_id: Ulid,
        actor_id: ActorId,
    },
    LeaveWaitlist {
        resource_id: Ulid,
        actor_id: ActorId,
    },
    Confirm {
        resource_id: Ulid,
        actor_id: ActorId,
    },
    SelectResources,
    SelectReservations {
        resource_id: Ulid,
    },
    SelectWaitlist {
        resource_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen {
            channel: channel_arg(rest)?,
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        if rest == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: channel_arg(rest)?,
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// `LISTEN foo` → `Some("foo")`. Case-insensitive, needs whitespace after the keyword.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    if head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn channel_arg(raw: &str) -> Result<String, SqlError> {
    let channel = raw.trim_matches('"');
    if channel.is_empty() {
        return Err(SqlError::Parse("missing channel name".into()));
    }
    Ok(channel.to_string())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();

    match table.as_str() {
        "resources" => {
            let row = Row::new(&columns, &values, &["id", "capacity", "name"]);
            let id = parse_ulid_expr(row.required("id")?)?;
            let capacity = match row.get("capacity") {
                Some(expr) => parse_u32(expr)?,
                None => 1,
            };
            let name = match row.get("name") {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertResource { id, capacity, name })
        }
        "reservations" | "waitlist" | "confirmations" => {
            let row = Row::new(&columns, &values, &["resource_id", "actor_id"]);
            let resource_id = parse_ulid_expr(row.required("resource_id")?)?;
            let actor_id = parse_string(row.required("actor_id")?)?;
            Ok(match table.as_str() {
                "reservations" => Command::Join {
                    resource_id,
                    actor_id,
                },
                "waitlist" => Command::JoinWaitlist {
                    resource_id,
                    actor_id,
                },
                _ => Command::Confirm {
                    resource_id,
                    actor_id,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = Vec::new();
    if let Some(selection) = &delete.selection {
        collect_eq_filters(selection, &mut filters);
    }

    match table.as_str() {
        "resources" => Ok(Command::DeactivateResource {
            id: parse_ulid_expr(filter(&filters, "id")?)?,
        }),
        "reservations" | "waitlist" => {
            let resource_id = parse_ulid_expr(filter(&filters, "resource_id")?)?;
            let actor_id = parse_string(filter(&filters, "actor_id")?)?;
            Ok(if table == "reservations" {
                Command::Leave {
                    resource_id,
                    actor_id,
                }
            } else {
                Command::LeaveWaitlist {
                    resource_id,
                    actor_id,
                }
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters);
    }

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "reservations" => Ok(Command::SelectReservations {
            resource_id: parse_ulid_expr(filter(&filters, "resource_id")?)?,
        }),
        "waitlist" => Ok(Command::SelectWaitlist {
            resource_id: parse_ulid_expr(filter(&filters, "resource_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// VALUES row addressed by column name. Without a column list the row is
/// read positionally in `default_order`.
struct Row<'a> {
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(columns: &[String], values: &'a [Expr], default_order: &[&str]) -> Self {
        let cells = if columns.is_empty() {
            default_order
                .iter()
                .zip(values)
                .map(|(c, v)| (c.to_string(), v))
                .collect()
        } else {
            columns.iter().cloned().zip(values).collect()
        };
        Self { cells }
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| *v)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out);
            collect_eq_filters(right, out);
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, right));
            }
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => {}
    }
}

fn filter<'a>(filters: &[(String, &'a Expr)], column: &'static str) -> Result<&'a Expr, SqlError> {
    filters
        .iter()
        .find(|(c, _)| c == column)
        .map(|(_, v)| *v)
        .ok_or(SqlError::MissingFilter(column))
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// First row of an INSERT's VALUES. Multi-row inserts are refused: each
/// row is its own transaction and would need its own result row.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Actor ids and names are strings; bare numbers are accepted as text.
fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const RID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn rid() -> Ulid {
        Ulid::from_string(RID).unwrap()
    }

    #[test]
    fn parse_insert_resource() {
        let sql = format!("INSERT INTO resources (id, capacity, name) VALUES ('{RID}', 3, 'Court 1')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertResource {
                id: rid(),
                capacity: 3,
                name: Some("Court 1".into()),
            }
        );
    }

    #[test]
    fn parse_insert_resource_defaults() {
        let sql = format!("INSERT INTO resources (id) VALUES ('{RID}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertResource {
                id: rid(),
                capacity: 1,
                name: None,
            }
        );
    }

    #[test]
    fn parse_insert_resource_columns_any_order() {
        let sql = format!("INSERT INTO resources (name, id, capacity) VALUES (NULL, '{RID}', 12)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertResource {
                id: rid(),
                capacity: 12,
                name: None,
            }
        );
    }

    #[test]
    fn parse_insert_without_column_list_is_positional() {
        let sql = format!("INSERT INTO reservations VALUES ('{RID}', 'alice')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Join {
                resource_id: rid(),
                actor_id: "alice".into(),
            }
        );
    }

    #[test]
    fn parse_join_waitlist_confirm() {
        let join = format!("INSERT INTO reservations (resource_id, actor_id) VALUES ('{RID}', 'a')");
        let queue = format!("INSERT INTO waitlist (resource_id, actor_id) VALUES ('{RID}', 'a')");
        let confirm =
            format!("INSERT INTO confirmations (resource_id, actor_id) VALUES ('{RID}', 'a')");
        assert!(matches!(parse_sql(&join).unwrap(), Command::Join { .. }));
        assert!(matches!(parse_sql(&queue).unwrap(), Command::JoinWaitlist { .. }));
        assert!(matches!(parse_sql(&confirm).unwrap(), Command::Confirm { .. }));
    }

    #[test]
    fn parse_leave_and_leave_waitlist() {
        let leave =
            format!("DELETE FROM reservations WHERE resource_id = '{RID}' AND actor_id = 'bob'");
        assert_eq!(
            parse_sql(&leave).unwrap(),
            Command::Leave {
                resource_id: rid(),
                actor_id: "bob".into(),
            }
        );
        let withdraw =
            format!("DELETE FROM waitlist WHERE actor_id = 'dave' AND resource_id = '{RID}'");
        assert_eq!(
            parse_sql(&withdraw).unwrap(),
            Command::LeaveWaitlist {
                resource_id: rid(),
                actor_id: "dave".into(),
            }
        );
    }

    #[test]
    fn parse_leave_requires_actor() {
        let sql = format!("DELETE FROM reservations WHERE resource_id = '{RID}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingFilter("actor_id"))
        ));
    }

    #[test]
    fn parse_delete_resource_deactivates() {
        let sql = format!("DELETE FROM resources WHERE id = '{RID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeactivateResource { id: rid() }
        );
    }

    #[test]
    fn parse_selects() {
        assert_eq!(
            parse_sql("SELECT * FROM resources").unwrap(),
            Command::SelectResources
        );
        let sql = format!("SELECT * FROM waitlist WHERE resource_id = '{RID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectWaitlist { resource_id: rid() }
        );
        let sql = format!("SELECT * FROM reservations WHERE resource_id = '{RID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectReservations { resource_id: rid() }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM waitlist"),
            Err(SqlError::MissingFilter("resource_id"))
        ));
    }

    #[test]
    fn parse_listen_unlisten() {
        let sql = format!("LISTEN resource_{RID};");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Listen {
                channel: format!("resource_{RID}"),
            }
        );
        assert_eq!(
            parse_sql(&format!("unlisten \"resource_{RID}\"")).unwrap(),
            Command::Unlisten {
                channel: format!("resource_{RID}"),
            }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
        assert!(parse_sql("LISTEN ").is_err());
    }

    #[test]
    fn parse_rejects_multi_row_insert() {
        let sql = format!(
            "INSERT INTO reservations (resource_id, actor_id) VALUES ('{RID}', 'a'), ('{RID}', 'b')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO bookings (id) VALUES ('{RID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_bad_ulid() {
        let sql = "SELECT * FROM waitlist WHERE resource_id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
