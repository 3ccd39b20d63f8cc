use chrono::{NaiveDate, Weekday};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::BookingRequest;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertDoctor {
        id: Ulid,
        name: Option<String>,
    },
    SelectDoctors,
    SetAvailability {
        doctor_id: Ulid,
        weekday: Weekday,
        start: TimeOfDay,
        end: TimeOfDay,
        is_available: bool,
    },
    SelectAvailability {
        doctor_id: Ulid,
        weekday: Option<Weekday>,
    },
    SelectSlots {
        doctor_id: Ulid,
        date: NaiveDate,
        granularity: Option<u16>,
    },
    SelectRecommendedSlots {
        doctor_id: Ulid,
        date: NaiveDate,
    },
    InsertAppointment(BookingRequest),
    /// Soft delete: the record stays, its status becomes cancelled.
    CancelAppointment {
        id: Ulid,
    },
    SetAppointmentStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    InsertRating {
        appointment_id: Ulid,
        rating: u8,
        review: Option<String>,
    },
    SelectAppointments(AppointmentFilter),
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
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches('"').to_string();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_single_row(insert)?;
    let arity = |need: usize| {
        if values.len() < need {
            Err(SqlError::WrongArity(table_label(&table), need, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "doctors" => {
            arity(1)?;
            Ok(Command::InsertDoctor {
                id: parse_ulid(&values[0])?,
                name: optional(&values, 1, parse_string_or_null)?.flatten(),
            })
        }
        "availability" => {
            arity(4)?;
            Ok(Command::SetAvailability {
                doctor_id: parse_ulid(&values[0])?,
                weekday: parse_weekday(&values[1])?,
                start: parse_time(&values[2])?,
                end: parse_time(&values[3])?,
                is_available: optional(&values, 4, parse_bool)?.unwrap_or(true),
            })
        }
        "appointments" => {
            arity(5)?;
            Ok(Command::InsertAppointment(BookingRequest {
                id: parse_ulid(&values[0])?,
                doctor_id: parse_ulid(&values[1])?,
                patient_id: parse_ulid(&values[2])?,
                date: parse_date(&values[3])?,
                time: parse_time(&values[4])?,
                duration_minutes: optional(&values, 5, parse_u16_or_null)?.flatten(),
                notes: optional(&values, 6, parse_string_or_null)?.flatten(),
            }))
        }
        "appointment_status" => {
            arity(2)?;
            Ok(Command::SetAppointmentStatus {
                id: parse_ulid(&values[0])?,
                status: parse_string(&values[1])?
                    .parse()
                    .map_err(SqlError::Parse)?,
            })
        }
        "ratings" => {
            arity(2)?;
            Ok(Command::InsertRating {
                appointment_id: parse_ulid(&values[0])?,
                rating: parse_u8(&values[1])?,
                review: optional(&values, 2, parse_string_or_null)?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "appointments" => Ok(Command::CancelAppointment { id }),
        _ => Err(SqlError::Unsupported(format!("DELETE from {table}"))),
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

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut predicates)?;
    }
    let find = |col: &str| {
        predicates
            .iter()
            .find(|p| p.column == col && p.op == BinaryOperator::Eq)
            .map(|p| p.value)
    };

    match table.as_str() {
        "doctors" => Ok(Command::SelectDoctors),
        "availability" => Ok(Command::SelectAvailability {
            doctor_id: parse_ulid(find("doctor_id").ok_or(SqlError::MissingFilter("doctor_id"))?)?,
            weekday: find("weekday").map(parse_weekday).transpose()?,
        }),
        "slots" => Ok(Command::SelectSlots {
            doctor_id: parse_ulid(find("doctor_id").ok_or(SqlError::MissingFilter("doctor_id"))?)?,
            date: parse_date(find("date").ok_or(SqlError::MissingFilter("date"))?)?,
            granularity: find("granularity").map(parse_u16).transpose()?,
        }),
        "recommended_slots" => Ok(Command::SelectRecommendedSlots {
            doctor_id: parse_ulid(find("doctor_id").ok_or(SqlError::MissingFilter("doctor_id"))?)?,
            date: parse_date(find("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        "appointments" => appointment_filter(&predicates).map(Command::SelectAppointments),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn appointment_filter(predicates: &[Predicate<'_>]) -> Result<AppointmentFilter, SqlError> {
    let mut filter = AppointmentFilter::default();
    for p in predicates {
        match (p.column.as_str(), &p.op) {
            ("id", BinaryOperator::Eq) => filter.id = Some(parse_ulid(p.value)?),
            ("doctor_id", BinaryOperator::Eq) => filter.doctor_id = Some(parse_ulid(p.value)?),
            ("patient_id", BinaryOperator::Eq) => filter.patient_id = Some(parse_ulid(p.value)?),
            ("status", BinaryOperator::Eq) => {
                filter.status = Some(parse_string(p.value)?.parse().map_err(SqlError::Parse)?)
            }
            ("date", BinaryOperator::Eq) => {
                let d = parse_date(p.value)?;
                filter.from = Some(d);
                filter.to = Some(d);
            }
            ("date", BinaryOperator::GtEq) => filter.from = Some(parse_date(p.value)?),
            ("date", BinaryOperator::LtEq) => filter.to = Some(parse_date(p.value)?),
            (col, op) => {
                return Err(SqlError::Unsupported(format!("appointments filter {col} {op}")));
            }
        }
    }
    Ok(filter)
}

// ── WHERE clauses ─────────────────────────────────────────────

/// One `column <op> value` term of an AND-only WHERE clause.
#[derive(Debug)]
struct Predicate<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::Eq | BinaryOperator::GtEq | BinaryOperator::LtEq => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.push(Predicate {
                    column,
                    op: op.clone(),
                    value: right,
                });
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn table_label(table: &str) -> &'static str {
    match table {
        "doctors" => "doctors",
        "availability" => "availability",
        "appointments" => "appointments",
        "appointment_status" => "appointment_status",
        "ratings" => "ratings",
        _ => "table",
    }
}

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

/// VALUES of a single-row INSERT. Every write is one operation, so
/// multi-row inserts are refused.
fn extract_single_row(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            rows => Err(SqlError::Unsupported(format!(
                "multi-row INSERT ({} rows); send one statement per row",
                rows.len()
            ))),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Parse `values[idx]` if present.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(idx).map(parse).transpose()
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u16_or_null(expr: &Expr) -> Result<Option<u16>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u16(expr).map(Some)
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s} (expected YYYY-MM-DD): {e}")))
}

fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = parse_string(expr)?;
    s.parse().map_err(|e: ParseTimeError| SqlError::Parse(e.to_string()))
}

fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = parse_string(expr)?;
    s.parse()
        .map_err(|_| SqlError::Parse(format!("bad weekday: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
