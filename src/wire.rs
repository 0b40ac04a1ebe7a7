use std::fmt::Debug;
use std::io;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::{Credentials, StayflowAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct StayflowHandler {
    engine: Arc<Engine>,
    query_parser: Arc<StayflowQueryParser>,
}

impl StayflowHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(StayflowQueryParser),
        }
    }

    /// The session user name is the acting user's id.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Ulid> {
        let user = client
            .metadata()
            .get("user")
            .ok_or_else(|| user_error("28000", "session has no user".into()))?;
        Ulid::from_string(user).map_err(|e| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("session user {user:?} is not a user id: {e}"))
        })
    }

    async fn run(&self, actor: Ulid, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, actor: Ulid, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::UpsertUser(user) => {
                engine.sync_user(actor, user).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpsertListing(listing) => {
                engine.sync_listing(actor, listing).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking(req) => {
                let outcome = engine.create_booking(actor, req).await.map_err(engine_err)?;
                Ok(transition_response(outcome.booking, outcome.advisory))
            }
            Command::ConfirmBooking { id } => {
                let outcome = engine.confirm_booking(actor, id).await.map_err(engine_err)?;
                Ok(transition_response(outcome.booking, outcome.advisory))
            }
            Command::CancelBooking { id } => {
                let outcome = engine.cancel_booking(actor, id).await.map_err(engine_err)?;
                Ok(transition_response(outcome.booking, outcome.advisory))
            }
            Command::DeleteBooking { id } => {
                let outcome = engine.destroy_booking(actor, id).await.map_err(engine_err)?;
                Ok(query_response(destroy_schema(), vec![outcome], |enc, o| {
                    enc.encode_field(&o.booking_id.to_string())?;
                    enc.encode_field(&o.withheld_commission.map(|d| d.to_string()))?;
                    enc.encode_field(&o.advisory())
                }))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(actor, id).await.map_err(engine_err)?;
                Ok(query_response(booking_schema(false), vec![booking], |enc, b| {
                    encode_booking(enc, b)
                }))
            }
            Command::SelectBookings { mine, filter } => {
                let bookings = if mine {
                    engine.list_my_bookings(actor, filter).await
                } else {
                    engine.list_bookings(actor, filter).await
                };
                Ok(query_response(booking_schema(false), bookings, |enc, b| {
                    encode_booking(enc, b)
                }))
            }
            Command::SelectPayments => {
                let payments = engine.my_payments(actor);
                Ok(query_response(payment_schema(), payments, encode_payment))
            }
            Command::SelectBookingLogs { booking_id } => {
                let entries = engine.audit_trail(actor, booking_id).map_err(engine_err)?;
                Ok(query_response(log_schema(), entries, encode_log))
            }
            Command::SelectHostStats => {
                let stats = engine.host_stats(actor).await.map_err(engine_err)?;
                Ok(query_response(host_stats_schema(), vec![stats], |enc, s| {
                    enc.encode_field(&s.host_id.to_string())?;
                    enc.encode_field(&(s.total_listings as i64))?;
                    enc.encode_field(&(s.total_bookings as i64))?;
                    enc.encode_field(&s.total_nights)?;
                    enc.encode_field(&s.total_earnings.to_string())
                }))
            }
            Command::SelectRenterStats => {
                let stats = engine.renter_stats(actor).await.map_err(engine_err)?;
                Ok(query_response(renter_stats_schema(), vec![stats], |enc, s| {
                    enc.encode_field(&s.renter_id.to_string())?;
                    enc.encode_field(&(s.total_bookings as i64))?;
                    enc.encode_field(&s.total_nights)?;
                    enc.encode_field(&s.total_spent.to_string())
                }))
            }
            Command::SelectCommissionStats => {
                let stats = engine.commission_stats(actor).await.map_err(engine_err)?;
                // One row per city, then a grand-total row with a NULL city.
                let mut rows: Vec<(Option<String>, i64, String)> = stats
                    .by_city
                    .iter()
                    .map(|c| {
                        (
                            Some(c.city.clone()),
                            c.payments as i64,
                            c.total_commission.to_string(),
                        )
                    })
                    .collect();
                let payments: usize = stats.by_city.iter().map(|c| c.payments).sum();
                rows.push((None, payments as i64, stats.total_commission.to_string()));
                Ok(query_response(commission_stats_schema(), rows, |enc, row| {
                    enc.encode_field(&row.0)?;
                    enc.encode_field(&row.1)?;
                    enc.encode_field(&row.2)
                }))
            }
        }
    }
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// A single booking row followed by the advisory text of the transition.
fn transition_response(booking: Booking, advisory: Option<String>) -> Response {
    query_response(booking_schema(true), vec![(booking, advisory)], |enc, (b, advisory)| {
        encode_booking(enc, b)?;
        enc.encode_field(advisory)
    })
}

fn encode_booking(enc: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.listing_id.to_string())?;
    enc.encode_field(&b.renter_id.to_string())?;
    enc.encode_field(&b.stay.start.to_string())?;
    enc.encode_field(&b.stay.end.to_string())?;
    enc.encode_field(&b.stay.nights())?;
    enc.encode_field(&b.status.to_string())?;
    enc.encode_field(&b.price.base_price.to_string())?;
    enc.encode_field(&b.price.commission_rate.to_string())?;
    enc.encode_field(&b.price.commission_amount.to_string())?;
    enc.encode_field(&b.price.total_price.to_string())?;
    enc.encode_field(&b.message)?;
    enc.encode_field(&b.created_at)?;
    enc.encode_field(&b.updated_at)
}

fn encode_payment(enc: &mut DataRowEncoder, p: &Payment) -> PgWireResult<()> {
    enc.encode_field(&p.id.to_string())?;
    enc.encode_field(&p.booking_id.to_string())?;
    enc.encode_field(&p.renter_id.to_string())?;
    enc.encode_field(&p.host_id.to_string())?;
    enc.encode_field(&p.listing_id.to_string())?;
    enc.encode_field(&p.base_rent.to_string())?;
    enc.encode_field(&p.commission_rate.to_string())?;
    enc.encode_field(&p.commission_amount.to_string())?;
    enc.encode_field(&p.total_amount.to_string())?;
    enc.encode_field(&p.is_paid)?;
    enc.encode_field(&p.paid_at)
}

fn encode_log(enc: &mut DataRowEncoder, e: &BookingLog) -> PgWireResult<()> {
    enc.encode_field(&e.id.to_string())?;
    enc.encode_field(&e.booking_id.to_string())?;
    enc.encode_field(&e.listing_id.to_string())?;
    enc.encode_field(&e.stay.start.to_string())?;
    enc.encode_field(&e.stay.end.to_string())?;
    enc.encode_field(&e.actor_id.map(|a| a.to_string()))?;
    enc.encode_field(&e.action.as_str().to_string())?;
    enc.encode_field(&e.description)?;
    enc.encode_field(&e.at)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema(with_advisory: bool) -> Vec<FieldInfo> {
    let mut fields = vec![
        field("id", Type::VARCHAR),
        field("listing_id", Type::VARCHAR),
        field("renter_id", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        field("nights", Type::INT8),
        field("status", Type::VARCHAR),
        field("base_price", Type::VARCHAR),
        field("commission_rate", Type::VARCHAR),
        field("commission_amount", Type::VARCHAR),
        field("total_price", Type::VARCHAR),
        field("message", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ];
    if with_advisory {
        fields.push(field("advisory", Type::VARCHAR));
    }
    fields
}

fn destroy_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("withheld_commission", Type::VARCHAR),
        field("advisory", Type::VARCHAR),
    ]
}

fn payment_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("renter_id", Type::VARCHAR),
        field("host_id", Type::VARCHAR),
        field("listing_id", Type::VARCHAR),
        field("base_rent", Type::VARCHAR),
        field("commission_rate", Type::VARCHAR),
        field("commission_amount", Type::VARCHAR),
        field("total_amount", Type::VARCHAR),
        field("is_paid", Type::BOOL),
        field("paid_at", Type::INT8),
    ]
}

fn log_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("listing_id", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        field("actor_id", Type::VARCHAR),
        field("action", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("at", Type::INT8),
    ]
}

fn host_stats_schema() -> Vec<FieldInfo> {
    vec![
        field("host_id", Type::VARCHAR),
        field("total_listings", Type::INT8),
        field("total_bookings", Type::INT8),
        field("total_nights", Type::INT8),
        field("total_earnings", Type::VARCHAR),
    ]
}

fn renter_stats_schema() -> Vec<FieldInfo> {
    vec![
        field("renter_id", Type::VARCHAR),
        field("total_bookings", Type::INT8),
        field("total_nights", Type::INT8),
        field("total_spent", Type::VARCHAR),
    ]
}

fn commission_stats_schema() -> Vec<FieldInfo> {
    vec![
        field("city", Type::VARCHAR),
        field("payments", Type::INT8),
        field("total_commission", Type::VARCHAR),
    ]
}

/// Row description for a statement, decided from its verb and target table
/// without binding parameters.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ',' | ';'))
        .filter(|w| !w.is_empty())
        .collect();
    let table_after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(|t| t.trim_matches('"'))
    };

    match words.first().copied() {
        Some("select") => match table_after("from") {
            Some("bookings" | "my_bookings") => booking_schema(false),
            Some("payments") => payment_schema(),
            Some("booking_logs") => log_schema(),
            Some("host_stats") => host_stats_schema(),
            Some("renter_stats") => renter_stats_schema(),
            Some("commission_stats") => commission_stats_schema(),
            _ => vec![],
        },
        Some("insert") => match table_after("into") {
            Some("bookings" | "confirmations" | "cancellations") => booking_schema(true),
            _ => vec![],
        },
        Some("delete") => match table_after("from") {
            Some("bookings") => destroy_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for StayflowHandler {
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
        let actor = self.resolve_actor(client)?;
        Ok(vec![self.run(actor, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StayflowQueryParser;

#[async_trait]
impl QueryParser for StayflowQueryParser {
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
impl ExtendedQueryHandler for StayflowHandler {
    type Statement = String;
    type QueryParser = StayflowQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        self.run(actor, &sql).await
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... with bound parameter values quoted as text.
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

fn substitute(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StayflowFactory {
    handler: Arc<StayflowHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<StayflowAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl StayflowFactory {
    pub fn new(engine: Arc<Engine>, credentials: Credentials) -> Self {
        let auth_source = StayflowAuthSource::new(credentials);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StayflowHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StayflowFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    credentials: Credentials,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = StayflowFactory::new(engine, credentials);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Forbidden(_) => "42501",
        EngineError::NotFound(_) => "P0002",
        EngineError::Overlap(_) => "23P01",
        EngineError::InvalidState { .. } | EngineError::AlreadyCancelled(_) => "55000",
        EngineError::AlreadyPaid(_) | EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidDateRange { .. } => "22008",
        EngineError::InvalidPriceInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(schema: &[FieldInfo]) -> Vec<String> {
        schema.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(
            count_params("INSERT INTO bookings VALUES ($1, $2, $3, $4)"),
            4
        );
        assert_eq!(count_params("SELECT $12, $3"), 12);
    }

    #[test]
    fn substitute_quotes_text_and_keeps_double_digit_placeholders() {
        let params: Vec<Option<bytes::Bytes>> = (1..=10)
            .map(|i| Some(bytes::Bytes::from(format!("v{i}"))))
            .collect();
        let sql = substitute("SELECT $1, $10", &params);
        assert_eq!(sql, "SELECT 'v1', 'v10'");

        let quoted = substitute(
            "INSERT INTO bookings (message) VALUES ($1)",
            &[Some(bytes::Bytes::from_static(b"it's quiet"))],
        );
        assert_eq!(quoted, "INSERT INTO bookings (message) VALUES ('it''s quiet')");

        let null = substitute("VALUES ($1)", &[None]);
        assert_eq!(null, "VALUES (NULL)");
    }

    #[test]
    fn result_schema_by_statement() {
        let select = result_schema("SELECT * FROM my_bookings WHERE status = $1");
        assert_eq!(names(&select)[0], "id");
        assert!(!names(&select).iter().any(|n| n == "advisory"));

        let confirm = result_schema("INSERT INTO confirmations (booking_id) VALUES ($1)");
        assert_eq!(names(&confirm).last().map(String::as_str), Some("advisory"));

        let destroy = result_schema("delete from bookings where id = $1");
        assert_eq!(names(&destroy), ["id", "withheld_commission", "advisory"]);

        assert!(result_schema("INSERT INTO users VALUES ($1, $2, $3)").is_empty());
        assert_eq!(
            names(&result_schema("SELECT * FROM commission_stats")),
            ["city", "payments", "total_commission"]
        );
    }

    #[test]
    fn engine_errors_map_to_sqlstates() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::Forbidden("no")), "42501");
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::Overlap(id)), "23P01");
        assert_eq!(sqlstate(&EngineError::AlreadyCancelled(id)), "55000");
        assert_eq!(
            sqlstate(&EngineError::InvalidState {
                id,
                status: BookingStatus::Confirmed
            }),
            "55000"
        );
        assert_eq!(sqlstate(&EngineError::AlreadyPaid(id)), "23505");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "54000");
    }
}
