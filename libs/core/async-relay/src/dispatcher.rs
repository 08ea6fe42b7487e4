//! Request dispatch
//!
//! `publish` is fire-and-forget: it returns the correlation id as soon as the
//! request is on the broker. Pair it with [`crate::WaitFacade::wait_for`] for a
//! synchronous-looking call.

use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::broker::ResilientBroker;
use crate::envelope::RequestEnvelope;
use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::result_store::ResultStore;
use crate::routes::RouteTable;

#[derive(Clone)]
pub struct Dispatcher {
    broker: ResilientBroker,
    results: ResultStore,
    routes: RouteTable,
}

impl Dispatcher {
    pub fn new(broker: ResilientBroker, results: ResultStore, routes: RouteTable) -> Self {
        Self {
            broker,
            results,
            routes,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Publish `operation` with a fresh correlation id and return that id.
    ///
    /// Fails with `UnknownOperation` before touching the broker, and with
    /// `PublishFailed` once connection retries are exhausted. A failed Processing
    /// marker write is logged only; the request is already on its way.
    #[instrument(skip(self, payload), fields(correlation_id = tracing::field::Empty))]
    pub async fn publish(&self, operation: &str, payload: Value) -> Result<String, RelayError> {
        let stream = self.routes.resolve(operation)?;

        let correlation_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let envelope = RequestEnvelope::new(correlation_id.clone(), operation, payload);
        let body = serde_json::to_string(&envelope)?;

        let message_id = match self.broker.publish_with_retry(stream, &body).await {
            Ok(id) => id,
            Err(source) => {
                RelayMetrics::publish_failed(operation);
                return Err(RelayError::PublishFailed {
                    operation: operation.to_string(),
                    source,
                });
            }
        };
        RelayMetrics::request_published(operation);

        match self.results.mark_processing(&correlation_id).await {
            Ok(true) => {}
            Ok(false) => info!("Result arrived before the processing marker"),
            Err(e) => warn!(error = %e, "Failed to write processing marker"),
        }

        info!(stream = %stream, message_id = %message_id, "Dispatched request");
        Ok(correlation_id)
    }
}
