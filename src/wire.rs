use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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

use crate::engine::{Engine, EngineError, SubmitRequest};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, SqlError};

pub struct OffhireHandler {
    engine: Arc<Engine>,
    query_parser: Arc<OffhireQueryParser>,
}

impl OffhireHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(OffhireQueryParser),
        }
    }

    /// Run one command, recording RED metrics around it.
    async fn run(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::SyncListing {
                id,
                owner_id,
                listing_type,
                status,
            } => {
                engine
                    .sync_listing(id, owner_id, listing_type, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetListingStatus {
                listing_id,
                caller,
                status,
            } => {
                engine
                    .set_listing_status(listing_id, &caller, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::RemoveListing { id } => {
                engine.remove_listing(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::CreateBlock {
                id,
                listing_id,
                caller,
                start,
                end,
                is_available,
                reason,
            } => {
                engine
                    .create_block(id, listing_id, &caller, start, end, is_available, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBlock { id, caller } => {
                engine.delete_block(id, &caller).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Submit {
                id,
                listing_id,
                start,
                end,
                renter,
            } => {
                engine
                    .submit(SubmitRequest {
                        id,
                        listing_id,
                        start,
                        end,
                        renter,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Confirm {
                request_id,
                caller,
                response,
            } => {
                engine
                    .confirm(request_id, &caller, response)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Decline {
                request_id,
                caller,
                response,
            } => {
                engine
                    .decline(request_id, &caller, response)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Cancel { request_id, caller } => {
                engine.cancel(request_id, &caller).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectBlocks {
                listing_id,
                start,
                end,
            } => {
                let blocks = engine
                    .list_blocks(listing_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(block_schema());
                let rows: Vec<PgWireResult<_>> = blocks
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.listing_id.to_string())?;
                        encoder.encode_field(&b.range.start.to_string())?;
                        encoder.encode_field(&b.range.end.to_string())?;
                        encoder.encode_field(&b.is_available)?;
                        encoder.encode_field(&b.reason)?;
                        encoder.encode_field(&b.request_id.map(|id| id.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectRequest { id } => {
                let view = engine.get_request(id).await.map_err(engine_err)?;
                Ok(request_rows(vec![view]))
            }
            Command::SelectListingRequests { listing_id } => {
                let views = engine.list_requests(listing_id).await.map_err(engine_err)?;
                Ok(request_rows(views))
            }
            Command::SelectOpenRequests { listing_id } => {
                let views = engine.open_requests(listing_id).await.map_err(engine_err)?;
                Ok(request_rows(views))
            }
            Command::SelectConflicts {
                listing_ids,
                start,
                end,
            } => {
                let conflicts = engine
                    .annotate_conflicts(&listing_ids, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(conflict_schema());
                // Keep the caller's order; unknown ids have no row.
                let mut seen = std::collections::HashSet::new();
                let rows: Vec<PgWireResult<_>> = listing_ids
                    .iter()
                    .filter(|id| seen.insert(**id))
                    .filter_map(|id| conflicts.get(id).map(|c| (id, *c)))
                    .map(|(id, conflict)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&id.to_string())?;
                        encoder.encode_field(&conflict)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::ExpireOverdue => {
                let expired = engine.sweep_expired().await as i64;
                let schema = Arc::new(expire_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&expired)?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn block_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("listing_id", Type::VARCHAR),
        text_field("start_date", Type::VARCHAR),
        text_field("end_date", Type::VARCHAR),
        text_field("is_available", Type::BOOL),
        text_field("reason", Type::VARCHAR),
        text_field("request_id", Type::VARCHAR),
    ]
}

fn request_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("listing_id", Type::VARCHAR),
        text_field("start_date", Type::VARCHAR),
        text_field("end_date", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("renter_id", Type::VARCHAR),
        text_field("guest_name", Type::VARCHAR),
        text_field("guest_phone", Type::VARCHAR),
        text_field("expires_at", Type::INT8),
        text_field("owner_response", Type::VARCHAR),
        text_field("responded_at", Type::INT8),
        text_field("created_at", Type::INT8),
        text_field("block_id", Type::VARCHAR),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        text_field("listing_id", Type::VARCHAR),
        text_field("has_conflict", Type::BOOL),
    ]
}

fn expire_schema() -> Vec<FieldInfo> {
    vec![text_field("expired", Type::INT8)]
}

fn request_rows(views: Vec<RequestView>) -> Response {
    let schema = Arc::new(request_schema());
    let rows: Vec<PgWireResult<_>> = views
        .into_iter()
        .map(|v| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&v.id.to_string())?;
            encoder.encode_field(&v.listing_id.to_string())?;
            encoder.encode_field(&v.range.start.to_string())?;
            encoder.encode_field(&v.range.end.to_string())?;
            encoder.encode_field(&v.status.to_string())?;
            encoder.encode_field(&v.renter_id.map(|id| id.to_string()))?;
            encoder.encode_field(&v.guest_name)?;
            encoder.encode_field(&v.guest_phone)?;
            encoder.encode_field(&v.expires_at)?;
            encoder.encode_field(&v.owner_response)?;
            encoder.encode_field(&v.responded_at)?;
            encoder.encode_field(&v.created_at)?;
            encoder.encode_field(&v.block_id.map(|id| id.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns for a statement, picked from the table it reads.
/// Statements may still carry `$n` placeholders here, so this can't go
/// through the full parser.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next() != Some("select") {
        return vec![];
    }
    let table = words
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_end_matches(';'));
    match table {
        Some("blocks") => block_schema(),
        Some("requests") | Some("open_requests") => request_schema(),
        Some("conflicts") => conflict_schema(),
        Some("expire_overdue") => expire_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for OffhireHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct OffhireQueryParser;

#[async_trait]
impl QueryParser for OffhireQueryParser {
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
        Ok(vec![Type::VARCHAR; sql::placeholder_count(stmt)])
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
impl ExtendedQueryHandler for OffhireHandler {
    type Statement = String;
    type QueryParser = OffhireQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_bound(&portal.statement.statement, &bound_params(portal))
            .map_err(sql_err)?;
        self.run(cmd).await
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
        let param_types = vec![Type::VARCHAR; sql::placeholder_count(&target.statement)];
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

/// Bound parameters as text. Every parameter is described as VARCHAR, so
/// clients send the text format.
fn bound_params(portal: &Portal<String>) -> Vec<Option<String>> {
    portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect()
}

// ── Factory ──────────────────────────────────────────────────────

/// One shared secret for the backend services talking to the engine.
/// End-user identity travels per statement as caller ids.
#[derive(Debug)]
pub struct OffhireAuthSource {
    password: String,
}

#[async_trait]
impl AuthSource for OffhireAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct OffhireFactory {
    handler: Arc<OffhireHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<OffhireAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl OffhireFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = OffhireAuthSource { password };
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(OffhireHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for OffhireFactory {
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
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(OffhireFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Forbidden => "42501",
        EngineError::WrongState(..) | EngineError::Expired(_) | EngineError::Unavailable(_) => {
            "55000"
        }
        EngineError::RateLimited => "53400",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    // Storage failures are already logged with context; clients get no detail.
    let message = if e.is_recoverable() {
        e.to_string()
    } else {
        "internal error".to_string()
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        message,
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::TooManyIds(_) => "54000",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_count_finds_highest() {
        assert_eq!(sql::placeholder_count("SELECT * FROM blocks WHERE listing_id = $1"), 1);
        assert_eq!(sql::placeholder_count("INSERT INTO requests VALUES ($1, $2, $10, $3)"), 10);
        assert_eq!(sql::placeholder_count("INSERT INTO declines VALUES ($1, $2, 'pay $9')"), 2);
        assert_eq!(sql::placeholder_count("SELECT * FROM expire_overdue"), 0);
    }

    #[test]
    fn result_schema_by_table() {
        assert_eq!(result_schema("SELECT * FROM blocks WHERE listing_id = $1").len(), 7);
        assert_eq!(result_schema("select * from open_requests where listing_id = $1").len(), 13);
        assert_eq!(result_schema("SELECT * FROM conflicts WHERE listing_id IN ($1)").len(), 2);
        assert_eq!(result_schema("SELECT * FROM expire_overdue;").len(), 1);
        assert!(result_schema("INSERT INTO blocks VALUES ($1)").is_empty());
    }

    #[test]
    fn error_codes() {
        assert_eq!(sqlstate(&EngineError::Conflict(ulid::Ulid::nil())), "23P01");
        assert_eq!(sqlstate(&EngineError::Expired(ulid::Ulid::nil())), "55000");
        assert_eq!(sqlstate(&EngineError::Forbidden), "42501");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "XX000");
    }
}
