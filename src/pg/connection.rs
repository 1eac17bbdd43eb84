//! PostgreSQL connection implementation.
//!
//! This module provides the TCP transport that handles:
//! - Connection establishment
//! - Startup and authentication (cleartext, MD5, SCRAM-SHA-256)
//! - Framing of [`Request`]s onto the simple and extended query protocols

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::auth::{md5_password, ScramExchange, SCRAM_SHA_256};
use super::channel::{Request, WireChannel, WireResponse};
use super::config::PgConfig;
use super::error::{PgError, PgResult};
use super::protocol::*;

/// A PostgreSQL connection.
pub struct PgConnection {
    /// TCP stream reader
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    /// TCP stream writer
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    /// Current transaction status
    transaction_status: TransactionStatus,
    /// Backend process ID
    backend_pid: i32,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    /// Whether the connection is closed
    closed: bool,
    /// Read buffer for incoming messages
    read_buffer: BytesMut,
}

impl PgConnection {
    /// Connect and authenticate.
    pub async fn connect(config: &PgConfig) -> PgResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = TcpStream::connect(&addr).await.map_err(PgError::Io)?;
        stream.set_nodelay(true).map_err(PgError::Io)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            transaction_status: TransactionStatus::Idle,
            backend_pid: 0,
            parameters: HashMap::new(),
            closed: false,
            read_buffer: BytesMut::with_capacity(32768), // 32KB buffer for better throughput
        };

        conn.startup(config).await?;
        debug!(
            host = %config.host,
            database = %config.database,
            backend_pid = conn.backend_pid,
            "connected"
        );
        Ok(conn)
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self, config: &PgConfig) -> PgResult<()> {
        let startup = StartupMessage {
            user: config.user.clone(),
            database: Some(config.database.clone()),
            options: config
                .application_name
                .as_ref()
                .map(|name| vec![("application_name".to_string(), name.clone())])
                .unwrap_or_default(),
        };
        self.send_message(&startup).await?;

        let password = || {
            config
                .password
                .clone()
                .ok_or_else(|| PgError::Auth("Password required".to_string()))
        };
        let mut scram: Option<ScramExchange> = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    self.send_message(&PasswordMessage {
                        password: password()?,
                    })
                    .await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let hash = md5_password(&config.user, &password()?, &salt);
                    self.send_message(&PasswordMessage { password: hash }).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(PgError::Auth(format!(
                            "Server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    let exchange = ScramExchange::new(&config.user, &password()?);
                    self.send_message(&SaslInitialResponseMessage {
                        mechanism: SCRAM_SHA_256.to_string(),
                        data: exchange.client_first(),
                    })
                    .await?;
                    scram = Some(exchange);
                }
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let exchange = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("unexpected SASL challenge".to_string()))?;
                    let data = exchange.client_final(&data)?;
                    self.send_message(&SaslResponseMessage { data }).await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    scram
                        .as_ref()
                        .ok_or_else(|| PgError::Protocol("unexpected SASL final".to_string()))?
                        .verify(&data)?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData { process_id, .. } => {
                    self.backend_pid = process_id;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::from_fields(&fields));
                }
                _ => {
                    // Ignore other messages during startup
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// A server parameter reported at startup or later (e.g. `server_version`).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Write one request as a single flushed batch of messages.
    async fn write_request(&mut self, request: &Request) -> PgResult<()> {
        match request {
            Request::Prepare {
                name,
                sql,
                param_types,
            } => {
                self.buffer_message(&ParseMessage {
                    name,
                    query: sql,
                    param_types,
                })
                .await?;
                self.buffer_message(&DescribeMessage { kind: b'S', name })
                    .await?;
            }
            Request::ExecutePrepared { name, params } => {
                self.buffer_message(&BindMessage {
                    portal: "",
                    statement: name,
                    params,
                })
                .await?;
                self.buffer_message(&ExecuteMessage {
                    portal: "",
                    max_rows: 0,
                })
                .await?;
            }
            Request::ExecuteSql { sql, params } => {
                let param_types: Vec<_> = params.iter().map(|p| p.type_oid).collect();
                self.buffer_message(&ParseMessage {
                    name: "",
                    query: sql,
                    param_types: &param_types,
                })
                .await?;
                self.buffer_message(&BindMessage {
                    portal: "",
                    statement: "",
                    params,
                })
                .await?;
                self.buffer_message(&DescribeMessage {
                    kind: b'P',
                    name: "",
                })
                .await?;
                self.buffer_message(&ExecuteMessage {
                    portal: "",
                    max_rows: 0,
                })
                .await?;
            }
            Request::Simple { sql } => {
                return self.send_message(&QueryMessage { query: sql }).await;
            }
            Request::Deallocate { names } => {
                let sql = Request::deallocate_sql(names);
                return self.send_message(&QueryMessage { query: &sql }).await;
            }
        }
        self.buffer_message(&SyncMessage).await?;
        self.flush().await
    }

    /// Send a frontend message and flush.
    async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        msg.validate()?;
        let encoded = msg.encode();
        self.writer.write_all(&encoded).await.map_err(PgError::Io)?;
        self.writer.flush().await.map_err(PgError::Io)?;
        Ok(())
    }

    /// Buffer a frontend message without flushing.
    #[inline]
    async fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        msg.validate()?;
        let encoded = msg.encode();
        self.writer.write_all(&encoded).await.map_err(PgError::Io)?;
        Ok(())
    }

    #[inline]
    async fn flush(&mut self) -> PgResult<()> {
        self.writer.flush().await.map_err(PgError::Io)?;
        Ok(())
    }

    /// Receive a backend message.
    async fn receive_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            // Try to decode from buffer first
            if self.read_buffer.len() >= 5 {
                let length = i32::from_be_bytes([
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                    self.read_buffer[4],
                ]);
                if length < 4 {
                    return Err(PgError::Protocol(format!(
                        "Invalid message length {}",
                        length
                    )));
                }
                let total_len = 1 + length as usize; // type byte + length field value

                if self.read_buffer.len() >= total_len {
                    let msg_bytes = self.read_buffer.split_to(total_len);
                    return BackendMessage::decode(&mut Bytes::from(msg_bytes));
                }
            }

            // Need more data
            let mut buf = [0u8; 4096];
            let n = self.reader.read(&mut buf).await.map_err(PgError::Io)?;
            if n == 0 {
                self.closed = true;
                return Err(PgError::ConnectionClosed);
            }
            self.read_buffer.extend_from_slice(&buf[..n]);
        }
    }
}

impl WireChannel for PgConnection {
    async fn send(&mut self, request: &Request) -> PgResult<()> {
        if self.closed {
            return Err(PgError::ConnectionClosed);
        }
        trace!(request = %request.sql(), "send");
        self.write_request(request).await
    }

    /// Collect everything up to ReadyForQuery. The first error is held back
    /// until then so the connection is ready for the next request either way.
    async fn receive(&mut self) -> PgResult<WireResponse> {
        let mut response = WireResponse::default();
        let mut error: Option<PgError> = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription { fields } => {
                    response.fields = fields;
                    response.rows.clear();
                }
                BackendMessage::ParameterDescription { type_oids } => {
                    response.param_types = type_oids;
                }
                BackendMessage::DataRow { values } => {
                    response.rows.push(values);
                }
                BackendMessage::CommandComplete { tag } => {
                    response.command_tag = tag;
                }
                BackendMessage::ErrorResponse { fields } => {
                    if error.is_none() {
                        error = Some(PgError::from_fields(&fields));
                    }
                }
                BackendMessage::NoticeResponse { fields } => {
                    debug!(
                        message = fields.get(&b'M').map(String::as_str).unwrap_or(""),
                        "server notice"
                    );
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match error {
                        Some(e) => Err(e),
                        None => Ok(response),
                    };
                }
                _ => {
                    // ParseComplete, BindComplete, NoData, notifications
                }
            }
        }
    }

    async fn close(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send_message(&TerminateMessage).await
    }
}
