use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::executor::block_on;
use tracing::{debug, info, warn};
use vq_codec::{decode_schema, encode_schema_only, validate_schema};
use vq_common::{ClientConfig, ConnectionHandle, MetricsRegistry, Result, VqError};
use vq_execution::{AddMode, CreateTableMode, Transport, check_reply};
use vq_storage::MemoryEngine;

use crate::table::Table;

/// An open database connection.
///
/// Clones share one engine handle. The handle is released exactly once:
/// by [`Connection::close`] or when the last clone (and the last table opened
/// through it) is dropped. A drop inside a tokio runtime only schedules the
/// release on that runtime; async code that needs the handle gone at a known
/// point should call [`Connection::close`].
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
pub(crate) struct ConnectionInner {
    uri: String,
    transport: Arc<dyn Transport>,
    handle: ConnectionHandle,
    config: ClientConfig,
    metrics: MetricsRegistry,
    closed: AtomicBool,
}

impl ConnectionInner {
    pub(crate) fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Handle for an engine call, or `ConnectionClosed` without contacting
    /// the engine.
    pub(crate) fn handle(&self) -> Result<ConnectionHandle> {
        if self.is_closed() {
            return Err(VqError::ConnectionClosed(format!(
                "connection to '{}' is closed",
                self.uri
            )));
        }
        Ok(self.handle)
    }

    async fn release(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(uri = %self.uri, handle = %self.handle, "closing connection");
        check_reply(
            self.transport.disconnect(self.handle).await,
            "Failed to close connection",
        )
    }
}

/// Run a handle release started from `Drop`.
///
/// Inside a tokio runtime the release is spawned onto it, so a worker thread
/// never blocks on the transport; it runs once the runtime next polls. Outside
/// one it is driven to completion on the dropping thread.
pub(crate) fn release_detached<F>(release: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => drop(runtime.spawn(release)),
        Err(_) => block_on(release),
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(uri = %self.uri, handle = %self.handle, "releasing dropped connection");
        let transport = self.transport.clone();
        let (uri, handle) = (self.uri.clone(), self.handle);
        release_detached(async move {
            if let Err(status) = transport.disconnect(handle).await {
                warn!(uri = %uri, %status, "failed to release connection handle");
            }
        });
    }
}

impl Connection {
    /// Connect to `uri` through `transport`.
    pub async fn open(
        uri: &str,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Result<Self> {
        let handle = check_reply(transport.connect(uri).await, "Failed to connect")?;
        info!(uri, %handle, "connection opened");
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                uri: uri.to_string(),
                transport,
                handle,
                config,
                metrics: MetricsRegistry::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Connect to a fresh in-process engine with default configuration.
    pub async fn memory(uri: &str) -> Result<Self> {
        Self::open(uri, Arc::new(MemoryEngine::new()), ClientConfig::default()).await
    }

    pub fn open_blocking(
        uri: &str,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Result<Self> {
        block_on(Self::open(uri, transport, config))
    }

    pub fn memory_blocking(uri: &str) -> Result<Self> {
        block_on(Self::memory(uri))
    }

    pub fn uri(&self) -> &str {
        self.inner.uri()
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.config()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Prometheus text exposition of this connection's query and write metrics.
    pub fn prometheus_metrics(&self) -> String {
        self.inner.metrics().render_prometheus()
    }

    pub async fn table_names(&self) -> Result<Vec<String>> {
        let handle = self.inner.handle()?;
        check_reply(
            self.inner.transport().table_names(handle).await,
            "Failed to list tables",
        )
    }

    /// Create a table from `batches`; the first batch fixes the schema.
    ///
    /// With [`CreateTableMode::ExistOk`] an existing table is opened as is and
    /// `batches` are not written.
    pub async fn create_table(
        &self,
        name: &str,
        batches: Vec<RecordBatch>,
        mode: CreateTableMode,
    ) -> Result<Table> {
        let Some(schema) = batches.first().map(|b| b.schema()) else {
            return Err(VqError::InvalidInput(format!(
                "create_table('{name}') needs at least one batch; use create_empty_table for an empty table"
            )));
        };
        if mode == CreateTableMode::ExistOk && self.table_names().await?.iter().any(|t| t == name) {
            return self.open_table(name).await;
        }
        let table = self.create_empty_table(name, schema, mode).await?;
        table.add(batches, AddMode::Append).await?;
        Ok(table)
    }

    pub async fn create_empty_table(
        &self,
        name: &str,
        schema: SchemaRef,
        mode: CreateTableMode,
    ) -> Result<Table> {
        let handle = self.inner.handle()?;
        validate_schema(&schema)?;
        let schema_ipc = encode_schema_only(&schema)?;
        let table = check_reply(
            self.inner
                .transport()
                .create_table(handle, name, schema_ipc, mode)
                .await,
            "Failed to create table",
        )?;
        debug!(table = name, ?mode, handle = %table, "table created");
        self.table_from_handle(name, table).await
    }

    pub async fn open_table(&self, name: &str) -> Result<Table> {
        let handle = self.inner.handle()?;
        let table = check_reply(
            self.inner.transport().open_table(handle, name).await,
            "Failed to open table",
        )?;
        debug!(table = name, handle = %table, "table opened");
        self.table_from_handle(name, table).await
    }

    async fn table_from_handle(&self, name: &str, handle: vq_common::TableHandle) -> Result<Table> {
        let reply = self.inner.transport().table_schema(handle).await;
        let schema = match check_reply(reply, "Failed to read table schema")
            .and_then(|bytes| decode_schema(&bytes))
        {
            Ok(schema) => schema,
            Err(e) => {
                let _ = self.inner.transport().close_table(handle).await;
                return Err(e);
            }
        };
        Ok(Table::new(name, handle, schema, self.inner.clone()))
    }

    pub async fn drop_table(&self, name: &str) -> Result<()> {
        let handle = self.inner.handle()?;
        check_reply(
            self.inner.transport().drop_table(handle, name).await,
            "Failed to drop table",
        )?;
        debug!(table = name, "table dropped");
        Ok(())
    }

    /// Release the engine handle. Later calls on this connection, or on tables
    /// opened through it, fail with `ConnectionClosed`. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.inner.release().await
    }

    pub fn table_names_blocking(&self) -> Result<Vec<String>> {
        block_on(self.table_names())
    }

    pub fn create_table_blocking(
        &self,
        name: &str,
        batches: Vec<RecordBatch>,
        mode: CreateTableMode,
    ) -> Result<Table> {
        block_on(self.create_table(name, batches, mode))
    }

    pub fn create_empty_table_blocking(
        &self,
        name: &str,
        schema: SchemaRef,
        mode: CreateTableMode,
    ) -> Result<Table> {
        block_on(self.create_empty_table(name, schema, mode))
    }

    pub fn open_table_blocking(&self, name: &str) -> Result<Table> {
        block_on(self.open_table(name))
    }

    pub fn drop_table_blocking(&self, name: &str) -> Result<()> {
        block_on(self.drop_table(name))
    }

    pub fn close_blocking(&self) -> Result<()> {
        block_on(self.close())
    }
}
