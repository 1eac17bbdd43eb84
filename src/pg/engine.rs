//! Connection-scoped statement execution.
//!
//! A [`Session`] owns one channel and everything that is only valid for it:
//! the type registry, the promotion tracker, the prepared statement cache and
//! its pending operation. Each call picks between running SQL ad-hoc and
//! executing a prepared handle, and statements are prepared once they have
//! been seen twice.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::channel::{Request, WireChannel, WireResponse};
use super::config::{ExecutionConfig, PgConfig};
use super::connection::PgConnection;
use super::error::{PgError, PgResult};
use super::protocol::EncodedParam;
use super::result::ResultSet;
use super::statement::{
    CacheOwner, NormalizedStatementKey, PreparedStatementCache, SharedColumns,
    StatementCacheEntry,
};
use super::tracker::StatementPromotionTracker;
use super::types::{
    catalog_query, text, CatalogRow, Oid, PgValue, TypeCatalog, TypeDescriptor, TypeRegistry,
    WireValue,
};
use crate::error::{ExecError, Result};

/// A positional parameter, optionally with the server type it should be
/// encoded as.
#[derive(Debug, Clone, PartialEq)]
pub struct BindParam {
    pub type_oid: Option<Oid>,
    pub value: PgValue,
}

impl BindParam {
    /// Encode by the value's own shape.
    pub fn new(value: impl Into<PgValue>) -> Self {
        Self {
            type_oid: None,
            value: value.into(),
        }
    }

    /// Encode with the codec registered for `type_oid`.
    pub fn typed(type_oid: Oid, value: impl Into<PgValue>) -> Self {
        Self {
            type_oid: Some(type_oid),
            value: value.into(),
        }
    }
}

impl<T: Into<PgValue>> From<T> for BindParam {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// Outcome of one pass over a call.
enum Attempt {
    Done(ResultSet),
    /// The cached plan is unusable; the call may be repeated ad-hoc.
    Invalidated(PgError),
    Failed(PgError),
}

/// Statement execution over one connection.
pub struct Session<C: WireChannel> {
    channel: C,
    config: ExecutionConfig,
    registry: Arc<TypeRegistry>,
    tracker: StatementPromotionTracker,
    statements: PreparedStatementCache,
    search_path: String,
}

impl Session<PgConnection> {
    /// Open a TCP connection and apply the configured `search_path`.
    pub async fn connect(config: PgConfig) -> Result<Self> {
        config.execution.validate()?;
        let connection = PgConnection::connect(&config)
            .await
            .map_err(ExecError::from_connect)?;
        let mut session = Self::new(connection, config.execution.clone())?;
        match &config.execution.search_path {
            Some(path) => session.set_search_path(path).await?,
            None => session.refresh_search_path().await?,
        }
        Ok(session)
    }
}

impl<C: WireChannel> Session<C> {
    pub fn new(channel: C, config: ExecutionConfig) -> Result<Self> {
        Self::with_registry(channel, config, Arc::new(TypeRegistry::new()))
    }

    /// Share an existing registry, e.g. one seeded with application types.
    pub fn with_registry(
        channel: C,
        config: ExecutionConfig,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tracker: StatementPromotionTracker::new(config.statement_limit),
            statements: PreparedStatementCache::new(
                config.statement_limit,
                config.eviction_percent,
            ),
            search_path: config.search_path.clone().unwrap_or_default(),
            channel,
            config,
            registry,
        })
    }

    /// Partition the statement cache by a fixed owner instead of the process id.
    pub fn with_cache_owner(mut self, owner: CacheOwner) -> Self {
        self.statements.set_owner(owner);
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn search_path(&self) -> &str {
        &self.search_path
    }

    pub fn statement_cache(&self) -> &PreparedStatementCache {
        &self.statements
    }

    pub fn tracker(&self) -> &StatementPromotionTracker {
        &self.tracker
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Run `sql` with positional parameters.
    ///
    /// `name` only labels the call in logs.
    pub async fn execute(
        &mut self,
        sql: &str,
        name: Option<&str>,
        params: &[BindParam],
    ) -> Result<ResultSet> {
        let key = NormalizedStatementKey::new(self.search_path.clone(), sql);
        let label = name.unwrap_or("SQL");
        let mut retried = false;

        loop {
            match self.attempt(&key, params, retried).await {
                Attempt::Done(result) => {
                    debug!(statement = label, sql, rows = result.len(), "executed");
                    return Ok(result);
                }
                Attempt::Invalidated(err) if !retried => {
                    warn!(statement = label, sql, error = %err, "cached plan invalidated, retrying ad-hoc");
                    retried = true;
                }
                Attempt::Invalidated(err) | Attempt::Failed(err) => {
                    debug!(statement = label, sql, error = %err, "execution failed");
                    return Err(ExecError::translate(err, Some(sql)));
                }
            }
        }
    }

    async fn attempt(
        &mut self,
        key: &NormalizedStatementKey,
        params: &[BindParam],
        force_adhoc: bool,
    ) -> Attempt {
        if let Err(e) = self.finish_pending().await {
            return Attempt::Failed(e);
        }
        let prepared = self.config.prepared_statements && !force_adhoc;
        if prepared {
            if let Some(entry) = self.statements.lookup(key) {
                return self.execute_prepared(key, &entry, params).await;
            }
        }
        let promote = prepared && self.tracker.observe(key);
        self.execute_adhoc(key, params, promote).await
    }

    async fn execute_prepared(
        &mut self,
        key: &NormalizedStatementKey,
        entry: &StatementCacheEntry,
        params: &[BindParam],
    ) -> Attempt {
        let (params, _) = match self.encode_params(params, Some(entry)).await {
            Ok(encoded) => encoded,
            Err(e) => return Attempt::Failed(e),
        };
        trace!(handle = %entry.handle, "executing prepared statement");
        let request = Request::ExecutePrepared {
            name: entry.handle.clone(),
            params,
        };

        match self.round_trip(&request).await {
            Ok(response) => {
                let fields = if response.fields.is_empty() {
                    Arc::clone(&entry.fields)
                } else {
                    Arc::new(response.fields.clone())
                };
                Attempt::Done(self.result_set(fields, response).await)
            }
            Err(e) if e.is_plan_invalidated() => match self.statements.remove(key) {
                Ok(_) => Attempt::Invalidated(e),
                Err(queue_err) => Attempt::Failed(queue_err),
            },
            Err(e) => Attempt::Failed(e),
        }
    }

    /// Send literal SQL. When `promote` is set the statement's prepare is
    /// queued behind it and sent once its result has been read; otherwise the
    /// cache gets a chance to shed old handles.
    async fn execute_adhoc(
        &mut self,
        key: &NormalizedStatementKey,
        params: &[BindParam],
        promote: bool,
    ) -> Attempt {
        let (params, encoders) = match self.encode_params(params, None).await {
            Ok(encoded) => encoded,
            Err(e) => return Attempt::Failed(e),
        };
        let param_types: Vec<Oid> = params.iter().map(|p| p.type_oid).collect();
        let request = Request::ExecuteSql {
            sql: key.sql.clone(),
            params,
        };
        if let Err(e) = self.channel.send(&request).await {
            return Attempt::Failed(e);
        }

        let queued = if promote {
            self.tracker.forget(key);
            self.statements
                .add(key.clone(), encoders, param_types)
                .map(|entry| trace!(handle = %entry.handle, "promoting statement"))
        } else {
            self.statements.evict_oversized().map(|_| ())
        };
        let received = self.channel.receive().await;
        if let Err(e) = queued {
            return Attempt::Failed(e);
        }

        match received {
            Ok(mut response) => {
                if promote {
                    self.statements
                        .record_description(key, response.fields.clone(), Vec::new());
                }
                let fields = Arc::new(std::mem::take(&mut response.fields));
                let result = self.result_set(fields, response).await;
                if let Err(e) = self.statements.send_pending(&mut self.channel).await {
                    return Attempt::Failed(e);
                }
                Attempt::Done(result)
            }
            Err(e) => {
                self.statements.discard_pending();
                if promote {
                    self.statements.remove_without_deallocation(key);
                }
                Attempt::Failed(e)
            }
        }
    }

    /// Encode parameters, preferring the cached statement's encoders, then an
    /// explicitly requested type, then a type the server described.
    async fn encode_params(
        &mut self,
        params: &[BindParam],
        entry: Option<&StatementCacheEntry>,
    ) -> PgResult<(Vec<EncodedParam>, Vec<Option<Arc<TypeDescriptor>>>)> {
        let registry = Arc::clone(&self.registry);
        let mut encoded = Vec::with_capacity(params.len());
        let mut encoders = Vec::with_capacity(params.len());

        for (i, param) in params.iter().enumerate() {
            let cached = entry.and_then(|e| e.parameter_encoders.get(i).cloned().flatten());
            let encoder = match (cached, param.type_oid) {
                (Some(encoder), _) => Some(encoder),
                (None, Some(oid)) => Some(registry.lookup(oid, &mut *self).await),
                (None, None) => entry
                    .and_then(|e| e.param_types.get(i).copied())
                    .filter(|oid| *oid != Oid::UNSPECIFIED)
                    .and_then(|oid| registry.get(oid)),
            };

            encoded.push(match &encoder {
                Some(descriptor) => EncodedParam {
                    type_oid: if descriptor.is_passthrough() {
                        Oid::UNSPECIFIED
                    } else {
                        descriptor.oid
                    },
                    value: descriptor.encode(&param.value)?,
                },
                None => fallback_param(&param.value),
            });
            encoders.push(encoder);
        }
        Ok((encoded, encoders))
    }

    /// Attach decoders to a response. Unknown column types are resolved
    /// through the catalog and degrade to text.
    async fn result_set(&mut self, fields: SharedColumns, response: WireResponse) -> ResultSet {
        let registry = Arc::clone(&self.registry);
        let mut decoders = Vec::with_capacity(fields.len());
        for field in fields.iter() {
            decoders.push(
                registry
                    .lookup_column(field.type_oid, Some(&field.name), &mut *self)
                    .await,
            );
        }
        ResultSet::new(fields, decoders, response.rows, response.command_tag)
    }

    async fn round_trip(&mut self, request: &Request) -> PgResult<WireResponse> {
        self.channel.send(request).await?;
        self.channel.receive().await
    }

    async fn finish_pending(&mut self) -> PgResult<()> {
        self.statements.finish_pending(&mut self.channel).await
    }

    /// Run a statement over the simple query protocol, bypassing the cache.
    async fn run_simple(&mut self, sql: &str) -> Result<WireResponse> {
        self.finish_pending()
            .await
            .map_err(|e| ExecError::translate(e, None))?;
        self.round_trip(&Request::Simple {
            sql: sql.to_string(),
        })
        .await
        .map_err(|e| ExecError::translate(e, Some(sql)))
    }

    /// Switch `search_path`; statements cached under the old path are not
    /// reused under the new one.
    pub async fn set_search_path(&mut self, path: &str) -> Result<()> {
        self.run_simple(&format!("SET search_path TO {}", path))
            .await?;
        debug!(search_path = path, "search_path changed");
        self.search_path = path.to_string();
        Ok(())
    }

    /// Read the server's current `search_path` into the session context.
    pub async fn refresh_search_path(&mut self) -> Result<()> {
        let response = self.run_simple("SHOW search_path").await?;
        let path = response
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|cell| cell.as_deref())
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default();
        self.search_path = path;
        Ok(())
    }

    /// Forget all promotion counts and deallocate every cached handle of the
    /// current owner in one request.
    pub async fn clear_cache(&mut self) -> Result<()> {
        self.finish_pending()
            .await
            .map_err(|e| ExecError::translate(e, None))?;
        self.tracker.reset();
        let count = self
            .statements
            .clear()
            .map_err(|e| ExecError::translate(e, None))?;
        if let Err(e) = self.finish_pending().await {
            warn!(error = %e, "deallocating cached statements failed");
        }
        debug!(count, "statement cache cleared");
        Ok(())
    }

    /// Descriptor for `oid`, loading it from the catalog when unknown.
    pub async fn lookup_type(&mut self, oid: Oid) -> Arc<TypeDescriptor> {
        let registry = Arc::clone(&self.registry);
        registry.lookup(oid, &mut *self).await
    }

    /// Finish the pending operation and close the channel.
    pub async fn disconnect(mut self) -> Result<()> {
        if let Err(e) = self.finish_pending().await {
            warn!(error = %e, "pending operation failed during disconnect");
        }
        self.channel
            .close()
            .await
            .map_err(|e| ExecError::translate(e, None))
    }
}

impl<C: WireChannel> TypeCatalog for Session<C> {
    async fn fetch_types(&mut self, oids: &[Oid]) -> PgResult<Vec<CatalogRow>> {
        if self.statements.pending_in_flight() {
            self.finish_pending().await?;
        }
        let response = self
            .round_trip(&Request::Simple {
                sql: catalog_query(oids),
            })
            .await?;
        response
            .rows
            .iter()
            .map(|row| {
                let cells = row
                    .iter()
                    .map(|cell| cell.as_deref().map(std::str::from_utf8).transpose())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| PgError::Protocol(format!("catalog row is not UTF-8: {}", e)))?;
                CatalogRow::from_text_row(&cells)
            })
            .collect()
    }
}

/// Encode a parameter from its value alone.
fn fallback_param(value: &PgValue) -> EncodedParam {
    let wire = match value {
        PgValue::Bytea(data) => WireValue::Binary(data.clone()),
        other => text::format_value(other).map_or(WireValue::Null, WireValue::Text),
    };
    EncodedParam {
        type_oid: value.type_oid(),
        value: wire,
    }
}
