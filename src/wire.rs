use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::auth::ReservasAuthSource;
use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct ReservasHandler {
    engine: Arc<Engine>,
    config: Arc<Config>,
    query_parser: Arc<ReservasQueryParser>,
}

impl ReservasHandler {
    pub fn new(engine: Arc<Engine>, config: Arc<Config>) -> Self {
        Self {
            engine,
            config,
            query_parser: Arc::new(ReservasQueryParser),
        }
    }

    /// The login name becomes the acting user; admins come from config.
    fn actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        match client.metadata().get("user") {
            Some(user) if !user.is_empty() => Ok(self.config.actor_for(user)),
            _ => Err(user_error("28000", "no user in session".into())),
        }
    }

    async fn run(&self, actor: &Actor, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertFacility { id, name } => {
                engine.create_facility(actor, id, &name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateFacility { id, name } => {
                engine.rename_facility(actor, id, &name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteFacility { id } => {
                engine.delete_facility(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectFacilities => {
                let schema = Arc::new(facilities_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_facilities()
                    .await
                    .into_iter()
                    .map(|f| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&f.id)?;
                        encoder.encode_field(&f.name)?;
                        encoder.encode_field(&(f.booking_count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertBookings { request } => {
                let outcome = engine.book(actor, request).await.map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(outcome.created_count),
                ))
            }
            Command::UpdateBooking { id, patch } => {
                engine
                    .update_booking(actor, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { filter } => {
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_bookings(&filter)
                    .await
                    .into_iter()
                    .map(|info| {
                        let b = &info.booking;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.facility_id)?;
                        encoder.encode_field(&info.facility_name)?;
                        encoder.encode_field(&b.owner)?;
                        encoder.encode_field(&b.date.to_string())?;
                        encoder.encode_field(&format_clock(b.time.start))?;
                        encoder.encode_field(&format_clock(b.time.end))?;
                        encoder.encode_field(&b.color)?;
                        encoder.encode_field(&b.requester.name)?;
                        encoder.encode_field(&b.requester.phone)?;
                        encoder.encode_field(&b.requester.activity)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAvailability {
                facility_id,
                date,
                start,
                end,
            } => {
                let window = match (start, end) {
                    (None, None) => None,
                    (start, end) => Some(
                        TimeRange::new(start.unwrap_or(0), end.unwrap_or(MINUTES_PER_DAY))
                            .ok_or_else(|| {
                                user_error("22023", "availability window must have start < end".into())
                            })?,
                    ),
                };
                let slots = engine
                    .free_slots(facility_id, date, window)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&facility_id)?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&format_clock(slot.start))?;
                        encoder.encode_field(&format_clock(slot.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn facilities_schema() -> Vec<FieldInfo> {
    vec![int_field("id"), text_field("name"), int_field("booking_count")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        int_field("facility_id"),
        text_field("facility_name"),
        text_field("owner"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("color"),
        text_field("requester_name"),
        text_field("requester_phone"),
        text_field("activity_description"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        int_field("facility_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
    ]
}

/// Row description for a statement that has not been bound yet.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    let mut words = upper.split_whitespace();
    let table = words
        .by_ref()
        .find(|w| *w == "FROM")
        .and_then(|_| words.next())
        .map(|t| t.trim_end_matches(';').trim_matches('"'))
        .unwrap_or_default();
    match table {
        "FACILITIES" | "ESCENARIOS" => facilities_schema(),
        "BOOKINGS" | "RESERVAS" => bookings_schema(),
        "AVAILABILITY" | "DISPONIBILIDAD" => availability_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ReservasHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.actor(client)?;
        Ok(vec![self.run(&actor, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ReservasQueryParser;

#[async_trait]
impl QueryParser for ReservasQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservasHandler {
    type Statement = String;
    type QueryParser = ReservasQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.actor(client)?;
        let sql = substitute_params(portal);
        self.run(&actor, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Byte ranges and numbers of the `$N` placeholders outside quoted
/// literals and identifiers.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start, i, n));
                }
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Replace `$1`, `$2`, ... with the bound text parameters as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// Single pass over the statement: each placeholder is replaced once and
/// substituted text is never scanned again. Placeholders without a bound
/// parameter are left as they are.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReservasFactory {
    handler: Arc<ReservasHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ReservasAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ReservasFactory {
    pub fn new(engine: Arc<Engine>, config: Arc<Config>) -> Self {
        let auth_source = ReservasAuthSource::new(config.password.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReservasHandler::new(engine, config)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservasFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    config: Arc<Config>,
) -> std::io::Result<()> {
    let factory = Arc::new(ReservasFactory::new(engine, config));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::FacilityNotFound(_) => "23503",
        EngineError::HasBookings(_) => "23503",
        EngineError::BookingNotFound(_) => "P0002",
        EngineError::FacilityExists(_) | EngineError::DuplicateName(_) => "23505",
        EngineError::Conflict { .. } => "23P01",
        EngineError::Unauthorized(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(_) = e {
        tracing::error!("storage failure: {e}");
    }
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidValue(_) => "22007",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("DELETE FROM bookings WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO facilities (id, name) VALUES ($2, $1)"),
            2
        );
        assert_eq!(count_params("SELECT $12, $3"), 12);
        assert_eq!(count_params("SELECT '$'"), 0);
        assert_eq!(count_params("SELECT 'cuota $4' WHERE id = $1"), 1);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let sql = "UPDATE bookings SET requester_name = $2, requester_phone = $3 WHERE id = $1";
        let out = substitute(
            sql,
            &[Some("01ARZ3NDEKTSV4RRFFQ69G5FAV".into()), Some("O'Neil".into()), None],
        );
        assert_eq!(
            out,
            "UPDATE bookings SET requester_name = 'O''Neil', requester_phone = NULL WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'"
        );
    }

    #[test]
    fn substitute_does_not_clobber_two_digit_placeholders() {
        let params: Vec<Option<String>> = (1..=10).map(|n| Some(n.to_string())).collect();
        assert_eq!(substitute("$1 $10", &params), "'1' '10'");
    }

    #[test]
    fn dollar_signs_in_parameter_text_survive() {
        let sql = r#"INSERT INTO bookings (facility_id, activity_description) VALUES ($1, $2)"#;
        let out = substitute(sql, &[Some("1".into()), Some("cuota $1 por persona".into())]);
        assert_eq!(
            out,
            "INSERT INTO bookings (facility_id, activity_description) VALUES ('1', 'cuota $1 por persona')"
        );
        let Ok(sql::Command::InsertBookings { request }) = sql::parse_sql(&out) else {
            panic!("expected InsertBookings from {out}");
        };
        assert_eq!(request.requester.activity.as_deref(), Some("cuota $1 por persona"));
    }

    #[test]
    fn parameter_text_cannot_escape_its_literal() {
        let sql = "DELETE FROM bookings WHERE id = $1";
        let out = substitute(sql, &[Some("x' OR id = '$1".into())]);
        assert_eq!(out, "DELETE FROM bookings WHERE id = 'x'' OR id = ''$1'");
    }

    #[test]
    fn placeholders_inside_statement_literals_are_kept() {
        let sql = r#"UPDATE bookings SET color = '$2', "$3" = $2 WHERE id = $1"#;
        let out = substitute(sql, &[Some("A".into()), Some("rojo".into()), Some("z".into())]);
        assert_eq!(out, r#"UPDATE bookings SET color = '$2', "$3" = 'rojo' WHERE id = 'A'"#);
    }

    #[test]
    fn result_schema_by_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM facilities"), ["id", "name", "booking_count"]);
        assert_eq!(names("select * from bookings where owner = $1").len(), 11);
        assert_eq!(
            names("SELECT * FROM availability WHERE facility_id = $1 AND \"date\" = $2"),
            ["facility_id", "date", "start_time", "end_time"]
        );
        assert!(names("INSERT INTO bookings (color) VALUES ('azul')").is_empty());
        assert!(names("DELETE FROM bookings WHERE id = $1").is_empty());
    }

    #[test]
    fn sqlstate_mapping() {
        assert_eq!(engine_sqlstate(&EngineError::Validation("x".into())), "22023");
        assert_eq!(engine_sqlstate(&EngineError::FacilityNotFound(3)), "23503");
        assert_eq!(
            engine_sqlstate(&EngineError::Conflict {
                date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                existing: ulid::Ulid::new(),
            }),
            "23P01"
        );
        assert_eq!(engine_sqlstate(&EngineError::Unauthorized("x".into())), "42501");
        assert_eq!(engine_sqlstate(&EngineError::DuplicateName("A".into())), "23505");
        assert_eq!(sql_sqlstate(&SqlError::InvalidValue("date".into())), "22007");
        assert_eq!(sql_sqlstate(&SqlError::Empty), "42601");
    }
}
