//! Request/response channel between the execution core and the server.
//!
//! A channel carries one request at a time. `receive` consumes everything the
//! server sends for the last request up to and including ReadyForQuery, so a
//! failed request still leaves the channel synchronized.

use bytes::Bytes;

use super::error::PgResult;
use super::protocol::{EncodedParam, FieldDescription};
use super::types::Oid;

/// The wire operations the execution core issues.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Parse a named statement and describe it.
    Prepare {
        name: String,
        sql: String,
        param_types: Vec<Oid>,
    },
    /// Bind and execute a named statement.
    ExecutePrepared {
        name: String,
        params: Vec<EncodedParam>,
    },
    /// Run literal SQL through the unnamed statement with out-of-line values.
    ExecuteSql {
        sql: String,
        params: Vec<EncodedParam>,
    },
    /// Simple query protocol, no parameters.
    Simple { sql: String },
    /// Free named statements in one round trip.
    Deallocate { names: Vec<String> },
}

impl Request {
    /// `DEALLOCATE a1;DEALLOCATE a3;` for the given handles.
    pub fn deallocate_sql(names: &[String]) -> String {
        names
            .iter()
            .map(|name| format!("DEALLOCATE {};", name))
            .collect()
    }

    /// SQL text of the request, for logs and error messages.
    pub fn sql(&self) -> String {
        match self {
            Request::Prepare { sql, .. } | Request::ExecuteSql { sql, .. } => sql.clone(),
            Request::Simple { sql } => sql.clone(),
            Request::ExecutePrepared { name, .. } => format!("EXECUTE {}", name),
            Request::Deallocate { names } => Self::deallocate_sql(names),
        }
    }
}

/// Everything the server returned for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireResponse {
    pub fields: Vec<FieldDescription>,
    /// Parameter types reported by a statement description.
    pub param_types: Vec<Oid>,
    pub rows: Vec<Vec<Option<Bytes>>>,
    pub command_tag: String,
}

/// Half-duplex transport: `send` one request, then `receive` its response.
#[allow(async_fn_in_trait)]
pub trait WireChannel {
    async fn send(&mut self, request: &Request) -> PgResult<()>;

    async fn receive(&mut self) -> PgResult<WireResponse>;

    async fn close(&mut self) -> PgResult<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory channel that records requests and replays scripted responses.

    use std::collections::VecDeque;

    use super::*;
    use crate::pg::error::PgError;

    type Matcher = Box<dyn Fn(&Request) -> bool>;

    #[derive(Default)]
    pub struct ScriptedChannel {
        /// Every request sent, in order.
        pub sent: Vec<Request>,
        in_flight: VecDeque<Request>,
        script: Vec<(Matcher, PgResult<WireResponse>)>,
        pub closed: bool,
    }

    impl ScriptedChannel {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer the next request matching `matcher` with `response`, once.
        pub fn on<F>(&mut self, matcher: F, response: PgResult<WireResponse>) -> &mut Self
        where
            F: Fn(&Request) -> bool + 'static,
        {
            self.script.push((Box::new(matcher), response));
            self
        }

        /// Answer the next ad-hoc or prepared execution whose SQL or handle
        /// contains `needle`.
        pub fn on_sql(&mut self, needle: &str, response: PgResult<WireResponse>) -> &mut Self {
            let needle = needle.to_string();
            self.on(move |req| match req {
                Request::ExecuteSql { sql, .. } | Request::Simple { sql } => sql.contains(&needle),
                _ => false,
            }, response)
        }

        pub fn on_prepared(&mut self, handle: &str, response: PgResult<WireResponse>) -> &mut Self {
            let handle = handle.to_string();
            self.on(
                move |req| matches!(req, Request::ExecutePrepared { name, .. } if *name == handle),
                response,
            )
        }

        /// Requests sent but not yet received.
        pub fn unanswered(&self) -> usize {
            self.in_flight.len()
        }

        /// Sent requests with the catalog queries filtered out.
        pub fn traffic(&self) -> Vec<&Request> {
            self.sent
                .iter()
                .filter(|r| !matches!(r, Request::Simple { sql } if sql.contains("pg_type")))
                .collect()
        }
    }

    impl WireChannel for ScriptedChannel {
        async fn send(&mut self, request: &Request) -> PgResult<()> {
            if self.closed {
                return Err(PgError::ConnectionClosed);
            }
            if !self.in_flight.is_empty() {
                return Err(PgError::Protocol(format!(
                    "request sent while another is outstanding: {}",
                    request.sql()
                )));
            }
            self.sent.push(request.clone());
            self.in_flight.push_back(request.clone());
            Ok(())
        }

        async fn receive(&mut self) -> PgResult<WireResponse> {
            let request = self
                .in_flight
                .pop_front()
                .ok_or_else(|| PgError::Protocol("receive without a request".to_string()))?;
            if let Some(pos) = self.script.iter().position(|(m, _)| m(&request)) {
                return self.script.remove(pos).1;
            }
            let command_tag = match &request {
                Request::Prepare { .. } => String::new(),
                Request::Deallocate { .. } => "DEALLOCATE".to_string(),
                _ => "SELECT 0".to_string(),
            };
            Ok(WireResponse {
                command_tag,
                ..WireResponse::default()
            })
        }

        async fn close(&mut self) -> PgResult<()> {
            self.closed = true;
            Ok(())
        }
    }

    /// A text-format result with the given columns and rows.
    pub fn table(columns: &[(&str, Oid)], rows: &[&[Option<&str>]]) -> WireResponse {
        WireResponse {
            fields: columns
                .iter()
                .map(|(name, oid)| FieldDescription::new(*name, *oid))
                .collect(),
            param_types: Vec::new(),
            rows: rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|cell| cell.map(|s| Bytes::copy_from_slice(s.as_bytes())))
                        .collect()
                })
                .collect(),
            command_tag: format!("SELECT {}", rows.len()),
        }
    }

    pub fn server_error(code: &str, message: &str) -> PgError {
        PgError::Server {
            severity: "ERROR".to_string(),
            code: code.to_string(),
            message: message.to_string(),
            detail: None,
            hint: None,
        }
    }
}
