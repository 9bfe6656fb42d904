use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;
use ulid::Ulid;

use crate::engine::{BookingFilter, BookingPatch, BookingRequest};
use crate::model::*;
use crate::recurrence::{Frequency, RecurrenceRequest, TerminationMode};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertFacility {
        id: Option<FacilityId>,
        name: String,
    },
    UpdateFacility {
        id: FacilityId,
        name: String,
    },
    DeleteFacility {
        id: FacilityId,
    },
    SelectFacilities,
    /// One row: the anchor occurrence plus its recurrence columns.
    InsertBookings {
        request: BookingRequest,
    },
    UpdateBooking {
        id: BookingId,
        patch: BookingPatch,
    },
    DeleteBooking {
        id: BookingId,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectAvailability {
        facility_id: FacilityId,
        date: NaiveDate,
        start: Option<Minute>,
        end: Option<Minute>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql).map_err(parse_err)?;
    if parser.parse_keyword(Keyword::UPDATE) {
        return parse_update(&mut parser);
    }

    let stmts = parser.parse_statements().map_err(parse_err)?;
    match stmts.as_slice() {
        [] => Err(SqlError::Empty),
        [Statement::Insert(insert)] => parse_insert(insert),
        [Statement::Delete(delete)] => parse_delete(delete),
        [Statement::Query(query)] => parse_select(query),
        [other] => Err(SqlError::Unsupported(format!("{other}"))),
        _ => Err(SqlError::Unsupported("multiple statements".into())),
    }
}

fn parse_err(e: ParserError) -> SqlError {
    SqlError::Parse(e.to_string())
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    let [values] = rows else {
        return Err(SqlError::Unsupported(format!("{table}: one row per INSERT")));
    };
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "facilities" | "escenarios" => parse_insert_facility(&columns, values),
        "bookings" | "reservas" => {
            if columns.is_empty() {
                return Err(SqlError::Parse("bookings: column list required".into()));
            }
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity("bookings", columns.len(), values.len()));
            }
            let mut request = BookingRequest::default();
            for (column, value) in columns.iter().zip(values) {
                set_booking_column(&mut request, column, value)?;
            }
            Ok(Command::InsertBookings { request })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_insert_facility(columns: &[String], values: &[Expr]) -> Result<Command, SqlError> {
    // Without a column list: (name) or (id, name).
    let columns: Vec<&str> = match (columns.is_empty(), values.len()) {
        (false, _) => columns.iter().map(String::as_str).collect(),
        (true, 1) => vec!["name"],
        (true, 2) => vec!["id", "name"],
        (true, n) => return Err(SqlError::WrongArity("facilities", 2, n)),
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("facilities", columns.len(), values.len()));
    }

    let (mut id, mut name) = (None, None);
    for (column, value) in columns.iter().zip(values) {
        match *column {
            "id" => id = parse_int_or_null(value)?,
            "name" | "nombre" => name = parse_text_or_null(value)?,
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    Ok(Command::InsertFacility {
        id,
        name: name.ok_or(SqlError::MissingColumn("name"))?,
    })
}

fn set_booking_column(request: &mut BookingRequest, column: &str, value: &Expr) -> Result<(), SqlError> {
    let recurrence: &mut RecurrenceRequest = &mut request.recurrence;
    match column {
        "facility_id" => request.facility_id = parse_int_or_null(value)?,
        "date" => request.date = parse_date_or_null(value)?,
        "start_time" => request.start_time = parse_clock_or_null(value)?,
        "end_time" => request.end_time = parse_clock_or_null(value)?,
        "color" => request.color = parse_text_or_null(value)?,
        "frequency" => {
            recurrence.frequency = match parse_text_or_null(value)? {
                Some(s) => Frequency::parse(&s).ok_or_else(|| invalid("frequency", &s))?,
                None => Frequency::None,
            }
        }
        "interval" => recurrence.interval = parse_u32_or_null(value)?,
        "weekdays" => recurrence.weekdays = parse_weekdays(value)?,
        "termination" => {
            recurrence.termination = match parse_text_or_null(value)? {
                Some(s) => Some(TerminationMode::parse(&s).ok_or_else(|| invalid("termination", &s))?),
                None => None,
            }
        }
        "count" => recurrence.count = parse_u32_or_null(value)?,
        "end_date" => recurrence.end_date = parse_date_or_null(value)?,
        "requester_name" => request.requester.name = parse_text_or_null(value)?,
        "requester_phone" => request.requester.phone = parse_text_or_null(value)?,
        "activity_description" => request.requester.activity = parse_text_or_null(value)?,
        other => return Err(SqlError::UnknownColumn(other.to_string())),
    }
    Ok(())
}

// ── UPDATE ────────────────────────────────────────────────────

/// `UPDATE <table> SET col = value [, ...] WHERE id = <id>`, after the
/// UPDATE keyword has been consumed.
fn parse_update(parser: &mut Parser) -> Result<Command, SqlError> {
    let table = object_name_last(&parser.parse_object_name(false).map_err(parse_err)?)
        .ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    parser.expect_keyword_is(Keyword::SET).map_err(parse_err)?;
    let assignments = parser
        .parse_comma_separated(Parser::parse_assignment)
        .map_err(parse_err)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(parse_err)?)
    } else {
        None
    };
    while parser.consume_token(&Token::SemiColon) {}
    let trailing = parser.peek_token();
    if trailing.token != Token::EOF {
        return Err(SqlError::Parse(format!("unexpected {} after UPDATE", trailing.token)));
    }

    let mut set = Vec::with_capacity(assignments.len());
    for assignment in &assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &assignment.value));
    }
    let where_id = extract_where_id(&selection)?;

    match table.as_str() {
        "facilities" | "escenarios" => {
            let id = parse_int(where_id)?;
            let mut name = None;
            for (column, value) in set {
                match column.as_str() {
                    "name" | "nombre" => name = parse_text_or_null(value)?,
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateFacility {
                id,
                name: name.ok_or(SqlError::MissingColumn("name"))?,
            })
        }
        "bookings" | "reservas" => {
            let id = parse_ulid(where_id)?;
            let mut patch = BookingPatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "facility_id" => patch.facility_id = Some(parse_int(value)?),
                    "date" => patch.date = Some(parse_date(value)?),
                    "start_time" => patch.start_time = Some(parse_clock(value)?),
                    "end_time" => patch.end_time = Some(parse_clock(value)?),
                    "color" => patch.color = Some(parse_text(value)?),
                    "requester_name" => patch.requester_name = Some(parse_text_or_null(value)?),
                    "requester_phone" => patch.requester_phone = Some(parse_text_or_null(value)?),
                    "activity_description" => patch.activity = Some(parse_text_or_null(value)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateBooking { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "facilities" | "escenarios" => Ok(Command::DeleteFacility { id: parse_int(id)? }),
        "bookings" | "reservas" => Ok(Command::DeleteBooking { id: parse_ulid(id)? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "facilities" | "escenarios" => Ok(Command::SelectFacilities),
        "bookings" | "reservas" => {
            let mut filter = BookingFilter::default();
            for (column, op, value) in filters {
                match (column.as_str(), op) {
                    ("facility_id", Cmp::Eq) => filter.facility_id = Some(parse_int(value)?),
                    ("owner", Cmp::Eq) => filter.owner = Some(parse_text(value)?),
                    ("date", Cmp::Eq) => {
                        let day = parse_date(value)?;
                        filter.from = Some(day);
                        filter.to = Some(day);
                    }
                    ("date", Cmp::GtEq) => filter.from = Some(parse_date(value)?),
                    ("date", Cmp::LtEq) => filter.to = Some(parse_date(value)?),
                    (other, _) => return Err(SqlError::UnsupportedFilter(other.to_string())),
                }
            }
            Ok(Command::SelectBookings { filter })
        }
        "availability" | "disponibilidad" => {
            let (mut facility_id, mut date, mut start, mut end) = (None, None, None, None);
            for (column, op, value) in filters {
                match (column.as_str(), op) {
                    ("facility_id", Cmp::Eq) => facility_id = Some(parse_int(value)?),
                    ("date", Cmp::Eq) => date = Some(parse_date(value)?),
                    ("start_time", Cmp::GtEq) => start = Some(parse_clock(value)?),
                    ("end_time", Cmp::LtEq) => end = Some(parse_clock(value)?),
                    (other, _) => return Err(SqlError::UnsupportedFilter(other.to_string())),
                }
            }
            Ok(Command::SelectAvailability {
                facility_id: facility_id.ok_or(SqlError::MissingFilter("facility_id"))?,
                date: date.ok_or(SqlError::MissingFilter("date"))?,
                start,
                end,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

/// Flatten `a AND b AND ...` into `(column, op, value)` triples.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, Cmp, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::GtEq,
                ast::BinaryOperator::LtEq => Cmp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, cmp, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// The value side of a `WHERE id = <value>` clause.
fn extract_where_id(selection: &Option<Expr>) -> Result<&Expr, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => Ok(right),
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

fn invalid(what: &str, raw: &str) -> SqlError {
    SqlError::InvalidValue(format!("{what}: {raw:?}"))
}

/// String or number literal as text; `None` for NULL.
fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::InvalidValue("unexpected NULL".into()))
}

fn parse_int_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(Some(-parse_int(expr)?));
    }
    match parse_text_or_null(expr)? {
        Some(s) => s.trim().parse().map(Some).map_err(|_| invalid("integer", &s)),
        None => Ok(None),
    }
}

fn parse_int(expr: &Expr) -> Result<i64, SqlError> {
    parse_int_or_null(expr)?.ok_or_else(|| SqlError::InvalidValue("unexpected NULL".into()))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    match parse_int_or_null(expr)? {
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| SqlError::InvalidValue(format!("{v} out of range"))),
        None => Ok(None),
    }
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    match parse_text_or_null(expr)? {
        Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Some)
            .map_err(|_| invalid("date", &s)),
        None => Ok(None),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date_or_null(expr)?.ok_or_else(|| SqlError::InvalidValue("unexpected NULL".into()))
}

fn parse_clock_or_null(expr: &Expr) -> Result<Option<Minute>, SqlError> {
    match parse_text_or_null(expr)? {
        Some(s) => crate::model::parse_clock(&s).map(Some).ok_or_else(|| invalid("time", &s)),
        None => Ok(None),
    }
}

fn parse_clock(expr: &Expr) -> Result<Minute, SqlError> {
    parse_clock_or_null(expr)?.ok_or_else(|| SqlError::InvalidValue("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s.trim()).map_err(|_| invalid("booking id", &s))
}

/// `ARRAY[1,3,5]`, `'1,3,5'`, `'{1,3,5}'`, `''` or NULL. 0 is Sunday.
fn parse_weekdays(expr: &Expr) -> Result<Vec<u8>, SqlError> {
    let day = |raw: &str| raw.trim().parse::<u8>().map_err(|_| invalid("weekday", raw));
    if let Expr::Array(array) = expr {
        return array
            .elem
            .iter()
            .map(|e| {
                let n = parse_int(e)?;
                u8::try_from(n).map_err(|_| invalid("weekday", &n.to_string()))
            })
            .collect();
    }
    match parse_text_or_null(expr)? {
        Some(s) => s
            .trim()
            .trim_start_matches('{')
            .trim_end_matches('}')
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(day)
            .collect(),
        None => Ok(Vec::new()),
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
    MissingColumn(&'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    UnsupportedFilter(String),
    /// Well-formed SQL carrying a literal that is not a valid date, time,
    /// id or enum value.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(col) => write!(f, "unsupported filter on {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value for {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
