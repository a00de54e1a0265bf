use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        lot_id: Ulid,
        name: Option<String>,
    },
    SelectResources,
    InsertReservation {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        label: Option<String>,
    },
    /// Cancels; the row stays with status `cancelled`.
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectAvailability {
        lot_id: Ulid,
        start: Ms,
        end: Ms,
    },
    UpsertSchedule {
        kind: String,
        enabled: bool,
        frequency: String,
        hour: u32,
        timezone: Option<String>,
        recipients: Vec<String>,
        template: Option<String>,
    },
    SelectSchedules,
    SetSetting {
        key: String,
        value: Option<String>,
    },
    SelectSettings,
    DeleteOwner {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationFilter {
    /// No WHERE clause: the caller's own reservations.
    Mine,
    Id(Ulid),
    Resource(Ulid),
    Owner(String),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const RESOURCE_COLUMNS: &[&str] = &["id", "lot_id", "name"];
const RESERVATION_COLUMNS: &[&str] = &["id", "resource_id", "start", "end", "label"];
const SCHEDULE_COLUMNS: &[&str] = &[
    "kind",
    "enabled",
    "frequency",
    "hour",
    "timezone",
    "recipients",
    "template",
];
const SETTING_COLUMNS: &[&str] = &["key", "value"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "resources" => {
            let row = Row::new(insert, &values, RESOURCE_COLUMNS)?;
            Ok(Command::InsertResource {
                id: parse_ulid(row.required("id")?)?,
                lot_id: parse_ulid(row.required("lot_id")?)?,
                name: row.optional("name").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "reservations" => {
            let row = Row::new(insert, &values, RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                id: parse_ulid(row.required("id")?)?,
                resource_id: parse_ulid(row.required("resource_id")?)?,
                start: parse_i64(row.required("start")?)?,
                end: parse_i64(row.required("end")?)?,
                label: row.optional("label").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "schedules" => {
            let row = Row::new(insert, &values, SCHEDULE_COLUMNS)?;
            let recipients = row
                .optional("recipients")
                .map(parse_string_or_null)
                .transpose()?
                .flatten()
                .map(|list| {
                    list.split(',')
                        .map(|r| r.trim().to_string())
                        .filter(|r| !r.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            Ok(Command::UpsertSchedule {
                kind: parse_string(row.required("kind")?)?,
                enabled: row.optional("enabled").map(parse_bool).transpose()?.unwrap_or(true),
                frequency: parse_string(row.required("frequency")?)?,
                hour: parse_u32(row.required("hour")?)?,
                timezone: row.optional("timezone").map(parse_string_or_null).transpose()?.flatten(),
                recipients,
                template: row.optional("template").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "settings" => {
            let row = Row::new(insert, &values, SETTING_COLUMNS)?;
            Ok(Command::SetSetting {
                key: parse_string(row.required("key")?)?.to_lowercase(),
                value: parse_string_or_null(row.required("value")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation { id: parse_ulid_expr(id)? }),
        "owners" => Ok(Command::DeleteOwner { id: parse_string(id)? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            lot_id: parse_ulid_expr(filters.eq("lot_id").ok_or(SqlError::MissingFilter("lot_id"))?)?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "reservations" => {
            let filter = if let Some(id) = filters.eq("id") {
                ReservationFilter::Id(parse_ulid_expr(id)?)
            } else if let Some(rid) = filters.eq("resource_id") {
                ReservationFilter::Resource(parse_ulid_expr(rid)?)
            } else if let Some(owner) = filters.eq("owner") {
                ReservationFilter::Owner(parse_string(owner)?)
            } else {
                ReservationFilter::Mine
            };
            Ok(Command::SelectReservations { filter })
        }
        "resources" => Ok(Command::SelectResources),
        "schedules" => Ok(Command::SelectSchedules),
        "settings" => Ok(Command::SelectSettings),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters<'a> {
    equals: Vec<(String, &'a Expr)>,
    start: Option<Ms>,
    end: Option<Ms>,
}

impl<'a> Filters<'a> {
    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.equals
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
    }
}

fn extract_filters<'a>(expr: &'a Expr, filters: &mut Filters<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    filters.equals.push((col, &**right));
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        },
        _ => {}
    }
    Ok(())
}

/// One VALUES row, addressed by column name. Without a column list the
/// values are taken in the table's declared order.
struct Row<'a> {
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(insert: &ast::Insert, values: &'a [Expr], declared: &[&str]) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            declared.iter().take(values.len()).map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity("VALUES", columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self { columns, values })
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(column).ok_or(SqlError::MissingColumn(column))
    }
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_where_id(selection: &Option<Expr>) -> Result<&Expr, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => Ok(&**right),
        _ => Err(SqlError::MissingFilter("id")),
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
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string or NULL, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
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
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
