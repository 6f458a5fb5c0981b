//! End-to-end query handling: resolve, introspect, compile, poll, format.

use std::sync::Arc;
use std::time::Duration;

use rowtap_core::{FieldCatalog, QueryCompiler, QueryParams, Result, ResultBody};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::executor::perform_select_with_polling;
use crate::store::ConnectorStore;
use crate::ConnectionDescriptor;

#[derive(Clone)]
pub struct QueryService {
    store: Arc<ConnectorStore>,
    max_wait: Option<Duration>,
}

impl QueryService {
    pub fn new(store: Arc<ConnectorStore>) -> Self {
        Self { store, max_wait: None }
    }

    /// Cap caller-supplied `wait` values.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn store(&self) -> &Arc<ConnectorStore> {
        &self.store
    }

    /// Run one select for the source `id`.
    ///
    /// Parameters are compiled against the connector's current catalog
    /// before anything is read; any invalid parameter rejects the call.
    pub async fn select(
        &self,
        id: &str,
        descriptor: &ConnectionDescriptor,
        params: &QueryParams,
        cancel: &CancellationToken,
    ) -> Result<ResultBody> {
        let instance = self.store.resolve(id, descriptor).await?;
        let connector = instance.connector();
        let catalog = connector.field_info().await?;
        let compiled = QueryCompiler::new(connector.dialect(), &catalog).compile(params)?;

        let mut properties = compiled.properties;
        if let Some(max_wait) = self.max_wait {
            if properties.wait > max_wait {
                debug!("Capping wait for '{}' at {:?}", id, max_wait);
                properties.wait = max_wait;
            }
        }

        let result = perform_select_with_polling(
            &instance,
            &catalog,
            &properties,
            &compiled.filters,
            compiled.client_id.as_deref(),
            cancel,
        )
        .await?;
        info!(
            "Select on '{}' returned {} row(s) as {:?}",
            id,
            result.data.len(),
            compiled.format
        );
        Ok(ResultBody::render(result, compiled.format, compiled.pretty))
    }

    /// Current field catalog for the source `id`.
    pub async fn fields(&self, id: &str, descriptor: &ConnectionDescriptor) -> Result<FieldCatalog> {
        let instance = self.store.resolve(id, descriptor).await?;
        instance.connector().field_info().await
    }

    /// Tear down the cached connector for `id`.
    pub async fn close(&self, id: &str) -> bool {
        self.store.close(id).await
    }
}
