use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{md5_hash, sasl};
use postgres_protocol::escape::escape_identifier;
use postgres_protocol::message::{backend, frontend};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use super::catalog::{PgSlotCatalog, SlotCatalog, SlotDefinition};
use super::replication::encode_standby_status_update;
use super::types::{parse_lsn, Lsn, ReplicationMode, ReplicationOptions, SystemInfo};
use crate::config::PostgresConfig;
use crate::error::ServerError;
use crate::{Error, Result};

const DUPLICATE_OBJECT: &str = "42710";

/// One replication-mode connection to the server.
///
/// Before `start_replication` the connection accepts replication commands;
/// afterwards it only carries CopyData in both directions. Implementations are
/// driven by a single reader at a time.
#[async_trait]
pub trait ReplicationConnection: Send {
    async fn identify_system(&mut self) -> Result<SystemInfo>;

    /// Creates a slot; an existing slot yields [`Error::SlotAlreadyExists`].
    async fn create_replication_slot(&mut self, definition: &SlotDefinition) -> Result<()>;

    async fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: Lsn,
        options: &ReplicationOptions,
    ) -> Result<()>;

    /// Reads one frame, giving up at `deadline` with [`Error::Timeout`].
    ///
    /// Returns the CopyData payload, or `None` for frames that carry none.
    async fn receive(&mut self, deadline: Instant) -> Result<Option<Bytes>>;

    async fn send_standby_status_update(&mut self, lsn: Lsn) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens the connections a consumer needs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect_replication(
        &self,
        config: &PostgresConfig,
    ) -> Result<Box<dyn ReplicationConnection>>;

    async fn connect_catalog(&self, config: &PostgresConfig) -> Result<Box<dyn SlotCatalog>>;
}

/// Connects to a real PostgreSQL server.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    async fn connect_replication(
        &self,
        config: &PostgresConfig,
    ) -> Result<Box<dyn ReplicationConnection>> {
        let connection = PgReplicationConnection::connect(config).await?;
        Ok(Box::new(connection))
    }

    async fn connect_catalog(&self, config: &PostgresConfig) -> Result<Box<dyn SlotCatalog>> {
        let catalog = PgSlotCatalog::connect(config).await?;
        Ok(Box::new(catalog))
    }
}

/// A row returned by a simple query on the replication connection.
#[derive(Debug, Clone)]
pub struct SimpleRow {
    columns: Arc<[String]>,
    values: Vec<Option<String>>,
}

impl SimpleRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        let index = self.columns.iter().position(|name| name == column)?;
        self.values.get(index)?.as_deref()
    }
}

struct BackendFrame {
    tag: u8,
    raw: Bytes,
}

impl BackendFrame {
    fn body(&self) -> Bytes {
        self.raw.slice(5..)
    }

    fn decode(&self) -> Result<backend::Message> {
        let mut buf = BytesMut::from(&self.raw[..]);
        backend::Message::parse(&mut buf)?.ok_or_else(|| {
            Error::Protocol(format!("Incomplete '{}' message", self.tag as char))
        })
    }
}

/// Replication connection speaking the frontend/backend protocol over TCP.
///
/// Frames are assembled in an internal buffer, so a read cancelled by its
/// deadline resumes where it stopped on the next call.
pub struct PgReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    parameters: HashMap<String, String>,
    streaming: bool,
}

impl PgReplicationConnection {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Creating replication connection to PostgreSQL"
        );

        let connect_timeout = config.connect_timeout();
        let stream = within(connect_timeout, "connect", async {
            TcpStream::connect((config.host.as_str(), config.port))
                .await
                .map_err(|e| {
                    Error::Connection(format!("{}:{}: {}", config.host, config.port, e))
                })
        })
        .await?;
        stream.set_nodelay(true)?;

        let mut connection = Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            parameters: HashMap::new(),
            streaming: false,
        };
        within(connect_timeout, "startup", connection.startup(config)).await?;

        info!("Successfully connected to PostgreSQL in replication mode");
        Ok(connection)
    }

    /// Server parameters reported during startup, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    async fn startup(&mut self, config: &PostgresConfig) -> Result<()> {
        let params = [
            ("user", config.username.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("application_name", config.application_name.as_str()),
            ("client_encoding", "UTF8"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.iter().copied(), &mut buf)?;
        self.write(&buf).await?;

        self.authenticate(&config.username, &config.password).await?;

        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'S' => {
                    if let backend::Message::ParameterStatus(body) = frame.decode()? {
                        self.parameters
                            .insert(body.name()?.to_string(), body.value()?.to_string());
                    }
                }
                b'Z' => {
                    debug!("Ready for query");
                    return Ok(());
                }
                b'E' => return Err(Error::Server(parse_error_response(&frame.body()))),
                b'N' => log_notice(&frame),
                tag => trace!("Ignoring '{}' during startup", tag as char),
            }
        }
    }

    async fn authenticate(&mut self, user: &str, password: &str) -> Result<()> {
        loop {
            match self.read_auth().await? {
                backend::Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let password = require_password(password)?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(password.as_bytes(), &mut buf)?;
                    self.write(&buf).await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let password = require_password(password)?;
                    let hash = md5_hash(user.as_bytes(), password.as_bytes(), body.salt());
                    let mut buf = BytesMut::new();
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                    self.write(&buf).await?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut scram_offered = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        scram_offered |= mechanism == sasl::SCRAM_SHA_256;
                    }
                    if !scram_offered {
                        return Err(Error::Authentication(
                            "server offered no supported SASL mechanism".to_string(),
                        ));
                    }
                    self.scram_sha_256(require_password(password)?).await?;
                }
                _ => {
                    return Err(Error::Authentication(
                        "unsupported authentication method requested".to_string(),
                    ))
                }
            }
        }
    }

    async fn scram_sha_256(&mut self, password: &str) -> Result<()> {
        let mut scram =
            sasl::ScramSha256::new(password.as_bytes(), sasl::ChannelBinding::unsupported());

        let mut buf = BytesMut::new();
        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut buf)?;
        self.write(&buf).await?;

        match self.read_auth().await? {
            backend::Message::AuthenticationSaslContinue(body) => scram.update(body.data())?,
            _ => {
                return Err(Error::Authentication(
                    "expected SASL continue message".to_string(),
                ))
            }
        }

        buf.clear();
        frontend::sasl_response(scram.message(), &mut buf)?;
        self.write(&buf).await?;

        match self.read_auth().await? {
            backend::Message::AuthenticationSaslFinal(body) => scram.finish(body.data())?,
            _ => {
                return Err(Error::Authentication(
                    "expected SASL final message".to_string(),
                ))
            }
        }
        Ok(())
    }

    async fn read_auth(&mut self) -> Result<backend::Message> {
        let frame = self.read_frame().await?;
        match frame.tag {
            b'R' => frame.decode(),
            b'E' => Err(Error::Authentication(
                parse_error_response(&frame.body()).to_string(),
            )),
            tag => Err(Error::Protocol(format!(
                "Unexpected message '{}' during authentication",
                tag as char
            ))),
        }
    }

    /// Runs a replication command or catalog query and collects its text rows.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<SimpleRow>> {
        if self.streaming {
            return Err(Error::Replication {
                message: "Connection is streaming and cannot run queries".to_string(),
            });
        }

        debug!(query, "Sending simple query");
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.write(&buf).await?;

        let mut columns: Arc<[String]> = Arc::from(Vec::new());
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'T' => {
                    if let backend::Message::RowDescription(body) = frame.decode()? {
                        columns = body
                            .fields()
                            .map(|field| Ok(field.name().to_string()))
                            .collect::<Vec<_>>()?
                            .into();
                    }
                }
                b'D' => {
                    if let backend::Message::DataRow(body) = frame.decode()? {
                        let buffer = body.buffer();
                        let values = body
                            .ranges()
                            .map(|range| {
                                Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()))
                            })
                            .collect::<Vec<_>>()?;
                        rows.push(SimpleRow {
                            columns: columns.clone(),
                            values,
                        });
                    }
                }
                b'E' => failure = Some(parse_error_response(&frame.body())),
                b'N' => log_notice(&frame),
                b'Z' => {
                    return match failure {
                        Some(err) => Err(Error::Server(err)),
                        None => Ok(rows),
                    }
                }
                _ => {}
            }
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        debug!("Sending IDENTIFY_SYSTEM command");

        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.first().ok_or_else(|| Error::Replication {
            message: "Failed to get system info".to_string(),
        })?;

        let info = SystemInfo {
            system_id: row.get("systemid").unwrap_or("unknown").to_string(),
            timeline: row
                .get("timeline")
                .and_then(|t| t.parse().ok())
                .unwrap_or(1),
            xlogpos: parse_lsn(row.get("xlogpos").unwrap_or("0/0"))?,
            dbname: row.get("dbname").map(str::to_string),
        };

        debug!("System info: {:?}", info);
        Ok(info)
    }

    pub async fn create_replication_slot(&mut self, definition: &SlotDefinition) -> Result<()> {
        let query = create_slot_command(definition)?;
        info!("Creating replication slot: {}", definition.slot_name);

        match self.simple_query(&query).await {
            Ok(rows) => {
                if let Some(row) = rows.first() {
                    info!(
                        "Created replication slot '{}' at LSN {}",
                        row.get("slot_name").unwrap_or(&definition.slot_name),
                        row.get("consistent_point").unwrap_or("unknown")
                    );
                }
                Ok(())
            }
            Err(Error::Server(err)) if err.code == DUPLICATE_OBJECT => {
                Err(Error::SlotAlreadyExists(definition.slot_name.clone()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: Lsn,
        options: &ReplicationOptions,
    ) -> Result<()> {
        if self.streaming {
            return Err(Error::Replication {
                message: "Replication already started on this connection".to_string(),
            });
        }

        let query = start_replication_command(slot_name, start_lsn, options);
        info!("Starting replication from LSN: {}", start_lsn);
        debug!(query = %query, "Sending START_REPLICATION");

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.write(&buf).await?;

        let mut failure = None;
        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'W' => {
                    self.streaming = true;
                    info!("Entered CopyBoth mode for slot '{}'", slot_name);
                    return Ok(());
                }
                b'E' => failure = Some(parse_error_response(&frame.body())),
                b'N' => log_notice(&frame),
                b'Z' => {
                    return Err(match failure {
                        Some(err) => Error::Server(err),
                        None => Error::Replication {
                            message: format!("Server did not start streaming slot '{}'", slot_name),
                        },
                    })
                }
                _ => {}
            }
        }
    }

    pub async fn receive(&mut self, deadline: Instant) -> Result<Option<Bytes>> {
        let frame = match timeout_at(deadline, self.read_frame()).await {
            Ok(frame) => frame?,
            Err(_) => {
                return Err(Error::Timeout {
                    message: "no replication message before the polling deadline".to_string(),
                })
            }
        };

        match frame.tag {
            b'd' => Ok(Some(frame.body())),
            b'E' => Err(Error::Server(parse_error_response(&frame.body()))),
            b'c' => {
                debug!("Server ended the copy stream");
                self.streaming = false;
                Err(Error::Replication {
                    message: "server ended the replication stream".to_string(),
                })
            }
            b'N' => {
                log_notice(&frame);
                Ok(None)
            }
            tag => {
                trace!("Ignoring '{}' while streaming", tag as char);
                Ok(None)
            }
        }
    }

    pub async fn send_standby_status_update(&mut self, lsn: Lsn) -> Result<()> {
        if !self.streaming {
            return Err(Error::Replication {
                message: "No active replication stream".to_string(),
            });
        }

        let payload = encode_standby_status_update(lsn, Utc::now(), false);
        let mut buf = BytesMut::new();
        frontend::CopyData::new(payload)?.write(&mut buf);
        self.write(&buf).await?;

        debug!("Standby status update sent for LSN {}", lsn);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        info!("Closing replication connection");

        let mut buf = BytesMut::new();
        if self.streaming {
            frontend::copy_done(&mut buf);
            self.streaming = false;
        }
        frontend::terminate(&mut buf);
        self.write(&buf).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<BackendFrame> {
        loop {
            if let Some(frame) = split_frame(&mut self.read_buf)? {
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::Connection(
                    "Server closed the replication connection".to_string(),
                ));
            }
        }
    }
}

#[async_trait]
impl ReplicationConnection for PgReplicationConnection {
    async fn identify_system(&mut self) -> Result<SystemInfo> {
        PgReplicationConnection::identify_system(self).await
    }

    async fn create_replication_slot(&mut self, definition: &SlotDefinition) -> Result<()> {
        PgReplicationConnection::create_replication_slot(self, definition).await
    }

    async fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: Lsn,
        options: &ReplicationOptions,
    ) -> Result<()> {
        PgReplicationConnection::start_replication(self, slot_name, start_lsn, options).await
    }

    async fn receive(&mut self, deadline: Instant) -> Result<Option<Bytes>> {
        PgReplicationConnection::receive(self, deadline).await
    }

    async fn send_standby_status_update(&mut self, lsn: Lsn) -> Result<()> {
        PgReplicationConnection::send_standby_status_update(self, lsn).await
    }

    async fn close(&mut self) -> Result<()> {
        PgReplicationConnection::close(self).await
    }
}

async fn within<F, T>(limit: Option<Duration>, what: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, future).await.map_err(|_| Error::Timeout {
            message: format!("{} did not finish within {:?}", what, limit),
        })?,
        None => future.await,
    }
}

fn require_password(password: &str) -> Result<&str> {
    if password.is_empty() {
        return Err(Error::Authentication(
            "Password required but not provided".to_string(),
        ));
    }
    Ok(password)
}

fn log_notice(frame: &BackendFrame) {
    let notice = parse_error_response(&frame.body());
    warn!(code = %notice.code, "Server notice: {}", notice.message);
}

fn split_frame(buf: &mut BytesMut) -> Result<Option<BackendFrame>> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(Error::Protocol(format!("Invalid frame length: {}", len)));
    }

    let total = len as usize + 1;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let raw = buf.split_to(total).freeze();
    Ok(Some(BackendFrame { tag: raw[0], raw }))
}

fn parse_error_response(mut body: &[u8]) -> ServerError {
    let mut err = ServerError::default();

    while let Some((&field, rest)) = body.split_first() {
        if field == 0 {
            break;
        }
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        match field {
            b'S' if err.severity.is_empty() => err.severity = value,
            b'V' => err.severity = value,
            b'C' => err.code = value,
            b'M' => err.message = value,
            b'D' => err.detail = Some(value),
            _ => {}
        }
        body = rest.get(end + 1..).unwrap_or(&[]);
    }

    err
}

fn create_slot_command(definition: &SlotDefinition) -> Result<String> {
    let mut query = format!(
        "CREATE_REPLICATION_SLOT {}",
        escape_identifier(&definition.slot_name)
    );
    if definition.temporary {
        query.push_str(" TEMPORARY");
    }

    match definition.slot_type {
        ReplicationMode::Logical => {
            let action = match definition.snapshot_action.to_ascii_uppercase().as_str() {
                "" | "NOEXPORT_SNAPSHOT" => "NOEXPORT_SNAPSHOT",
                "EXPORT_SNAPSHOT" => "EXPORT_SNAPSHOT",
                "USE_SNAPSHOT" => "USE_SNAPSHOT",
                other => {
                    return Err(Error::Config(format!(
                        "unsupported snapshot action '{}' for slot '{}'",
                        other, definition.slot_name
                    )))
                }
            };
            query.push_str(&format!(
                " LOGICAL {} {}",
                escape_identifier(&definition.plugin),
                action
            ));
        }
        ReplicationMode::Physical => query.push_str(" PHYSICAL RESERVE_WAL"),
    }

    Ok(query)
}

fn start_replication_command(slot_name: &str, start_lsn: Lsn, options: &ReplicationOptions) -> String {
    let mut query = format!(
        "START_REPLICATION SLOT {} {} {}",
        escape_identifier(slot_name),
        options.mode,
        start_lsn
    );
    if options.mode == ReplicationMode::Logical && !options.plugin_args.is_empty() {
        query.push_str(&format!(" ({})", options.plugin_args.join(", ")));
    }
    query
}
