//! Long-poll select execution.
//!
//! One read is issued immediately. If it is empty and the caller allowed a
//! wait, the read is repeated (first after `initwait`, then every `poll`)
//! until rows appear or the `wait` budget is spent. An exhausted budget is
//! not an error: the last, empty result is returned.

use std::time::Duration;

use rowtap_core::{FieldCatalog, FieldRef, FilterSpec, QueryError, QueryProperties, Result, SelectResult, SortSpec};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::{ClientCursor, ConnectorInstance};
use crate::ReadRequest;

/// Floor applied to the caller's poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The parts of a query a continuation cursor depends on.
#[derive(Serialize)]
struct Signature<'a> {
    filters: &'a [FilterSpec],
    sort: Option<&'a [SortSpec]>,
    fields: Option<&'a [FieldRef]>,
}

fn query_signature(filters: &[FilterSpec], properties: &QueryProperties) -> Result<String> {
    Ok(serde_json::to_string(&Signature {
        filters,
        sort: properties.sort.as_deref(),
        fields: properties.fields.as_deref(),
    })?)
}

struct PollContext<'a> {
    instance: &'a ConnectorInstance,
    catalog: &'a FieldCatalog,
    properties: &'a QueryProperties,
    fields: Vec<FieldRef>,
    filters: &'a [FilterSpec],
    client_id: Option<&'a str>,
    signature: String,
}

impl PollContext<'_> {
    /// One read under the instance lock, advancing the client's cursor.
    async fn read_once(&self) -> Result<SelectResult> {
        let connector = self.instance.connector();
        let mut cursors = self.instance.lock_reads().await;
        let tracking = self.client_id.filter(|_| connector.marker().is_some());
        let after = tracking
            .and_then(|client| cursors.get(client))
            .filter(|cursor| cursor.signature == self.signature)
            .and_then(|cursor| cursor.last_seen.clone());
        // Offset only positions a cursor's first page; later reads resume
        // strictly after the last marker delivered.
        let offset = if after.is_some() { 0 } else { self.properties.offset };
        let request = ReadRequest {
            catalog: self.catalog,
            fields: &self.fields,
            filters: self.filters,
            sort: self.properties.sort.as_deref(),
            limit: self.properties.limit,
            offset,
            after: after.as_ref(),
            track_marker: tracking.is_some(),
        };
        let outcome = connector.read(&request).await?;
        if let Some(client) = tracking {
            let cursor = cursors
                .entry(client.to_string())
                .or_insert_with(|| ClientCursor::new(self.signature.clone()));
            if cursor.signature != self.signature {
                *cursor = ClientCursor::new(self.signature.clone());
            }
            if let Some(marker) = outcome.last_marker {
                cursor.last_seen = Some(marker);
            }
            cursor.last_used = std::time::Instant::now();
        }
        drop(cursors);
        self.instance.touch();
        debug!(
            "Read {} row(s) from '{}'{}",
            outcome.result.data.len(),
            self.instance.id(),
            tracking.map(|c| format!(" for client '{}'", c)).unwrap_or_default()
        );
        Ok(outcome.result)
    }

    async fn read_or_cancel(&self, cancel: &CancellationToken) -> Result<SelectResult> {
        tokio::select! {
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            result = self.read_once() => result,
        }
    }
}

/// Execute a compiled select against `instance`, polling while it is empty.
///
/// `properties.fields == None` projects every catalog field. With a
/// `client_id` and a marker column on the source, each client only sees rows
/// past the last marker it was sent.
pub async fn perform_select_with_polling(
    instance: &ConnectorInstance,
    catalog: &FieldCatalog,
    properties: &QueryProperties,
    filters: &[FilterSpec],
    client_id: Option<&str>,
    cancel: &CancellationToken,
) -> Result<SelectResult> {
    let fields = match &properties.fields {
        Some(fields) => fields.clone(),
        None => catalog.iter().map(|f| FieldRef::name(f.name.clone())).collect(),
    };
    let ctx = PollContext {
        instance,
        catalog,
        properties,
        fields,
        filters,
        client_id,
        signature: query_signature(filters, properties)?,
    };

    let deadline = Instant::now() + properties.wait;
    let mut result = ctx.read_or_cancel(cancel).await?;
    if !result.is_empty() || properties.wait.is_zero() {
        return Ok(result);
    }

    let poll = properties.poll.max(MIN_POLL_INTERVAL);
    let mut pause = if properties.initwait.is_zero() {
        poll
    } else {
        properties.initwait
    };
    let mut attempts = 1;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let nap = pause.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            _ = tokio::time::sleep(nap) => {}
        }
        result = ctx.read_or_cancel(cancel).await?;
        attempts += 1;
        if !result.is_empty() {
            break;
        }
        pause = poll;
    }
    debug!(
        "Polling '{}' finished after {} read(s), {} row(s)",
        instance.id(),
        attempts,
        result.data.len()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::finish_read;
    use crate::sqlite::SqliteDialect;
    use crate::{ConnectionDescriptor, Connector, ReadOutcome};
    use async_trait::async_trait;
    use rowtap_core::{Datatype, Dialect, FieldDescriptor};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Rows `(seq, label)`; visible once `visible_at` has passed.
    struct Timeline {
        rows: Mutex<Vec<(i64, &'static str)>>,
        visible_at: Instant,
        reads: AtomicUsize,
        marker: Option<String>,
    }

    impl Timeline {
        fn new(rows: Vec<(i64, &'static str)>, visible_after: Duration, marker: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(rows),
                visible_at: Instant::now() + visible_after,
                reads: AtomicUsize::new(0),
                marker: marker.map(String::from),
            })
        }
    }

    #[async_trait]
    impl Connector for Timeline {
        fn dialect(&self) -> &dyn Dialect {
            &SqliteDialect
        }

        fn marker(&self) -> Option<&str> {
            self.marker.as_deref()
        }

        async fn field_info(&self) -> Result<FieldCatalog> {
            Ok(catalog())
        }

        async fn read(&self, request: &ReadRequest<'_>) -> Result<ReadOutcome> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if Instant::now() < self.visible_at {
                return Ok(finish_read(request.fields, Vec::new(), request.track_marker));
            }
            let after = request.after.and_then(Value::as_i64).unwrap_or(i64::MIN);
            let rows: Vec<Vec<Value>> = self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(seq, _)| *seq > after || !request.track_marker)
                .map(|(seq, label)| {
                    let mut row = vec![json!(seq), json!(label)];
                    if request.track_marker {
                        row.push(json!(seq));
                    }
                    row
                })
                .collect();
            Ok(finish_read(request.fields, rows, request.track_marker))
        }
    }

    fn catalog() -> FieldCatalog {
        FieldCatalog::new(vec![
            FieldDescriptor::new("seq", Datatype::Number),
            FieldDescriptor::new("label", Datatype::String),
        ])
    }

    fn instance(connector: Arc<Timeline>) -> ConnectorInstance {
        ConnectorInstance::new(
            "timeline",
            ConnectionDescriptor::new("fake://timeline", "t"),
            "fake",
            "sqlite",
            connector,
        )
    }

    fn props(wait: f64, poll: f64, initwait: f64) -> QueryProperties {
        QueryProperties {
            wait: Duration::from_secs_f64(wait),
            poll: Duration::from_secs_f64(poll),
            initwait: Duration::from_secs_f64(initwait),
            ..QueryProperties::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_wait_returns_immediately() {
        let timeline = Timeline::new(vec![(1, "a")], Duration::from_secs(10), None);
        let inst = instance(timeline.clone());
        let started = Instant::now();
        let result = perform_select_with_polling(&inst, &catalog(), &props(0.0, 1.0, 0.0), &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(timeline.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_rows_appear() {
        let timeline = Timeline::new(vec![(1, "a")], Duration::from_secs(2), None);
        let inst = instance(timeline.clone());
        let started = Instant::now();
        let result = perform_select_with_polling(&inst, &catalog(), &props(5.0, 1.0, 0.0), &[], None, &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(result.data, vec![vec![json!(1), json!("a")]]);
        assert!(elapsed >= Duration::from_secs(2) && elapsed <= Duration::from_secs(3), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_wait_is_an_empty_success() {
        let timeline = Timeline::new(vec![(1, "a")], Duration::from_secs(60), None);
        let inst = instance(timeline.clone());
        let started = Instant::now();
        let result = perform_select_with_polling(&inst, &catalog(), &props(3.5, 1.0, 0.0), &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(started.elapsed(), Duration::from_millis(3500));
        // t=0, 1, 2, 3 and the final read at the deadline
        assert_eq!(timeline.reads.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn initwait_delays_the_first_retry() {
        let timeline = Timeline::new(vec![(1, "a")], Duration::from_secs(1), None);
        let inst = instance(timeline.clone());
        let started = Instant::now();
        let result = perform_select_with_polling(&inst, &catalog(), &props(10.0, 5.0, 2.0), &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_empty());
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(timeline.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_interval_has_a_floor() {
        let timeline = Timeline::new(vec![(1, "a")], Duration::from_secs(60), None);
        let inst = instance(timeline.clone());
        perform_select_with_polling(&inst, &catalog(), &props(1.0, 0.0, 0.0), &[], None, &CancellationToken::new())
            .await
            .unwrap();
        let reads = timeline.reads.load(Ordering::SeqCst);
        assert!(reads <= 1 + 20 + 1, "{} reads", reads);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let timeline = Timeline::new(vec![(1, "a")], Duration::from_secs(60), None);
        let inst = instance(timeline.clone());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = perform_select_with_polling(&inst, &catalog(), &props(30.0, 1.0, 0.0), &[], None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn clients_continue_from_their_last_marker() {
        let timeline = Timeline::new(vec![(1, "a"), (2, "b")], Duration::ZERO, Some("seq"));
        let inst = instance(timeline.clone());
        let (cat, p, cancel) = (catalog(), props(0.0, 1.0, 0.0), CancellationToken::new());

        let first = perform_select_with_polling(&inst, &cat, &p, &[], Some("dash"), &cancel).await.unwrap();
        assert_eq!(first.data.len(), 2);
        let again = perform_select_with_polling(&inst, &cat, &p, &[], Some("dash"), &cancel).await.unwrap();
        assert!(again.is_empty());

        timeline.rows.lock().unwrap().push((3, "c"));
        let next = perform_select_with_polling(&inst, &cat, &p, &[], Some("dash"), &cancel).await.unwrap();
        assert_eq!(next.data, vec![vec![json!(3), json!("c")]]);

        let other = perform_select_with_polling(&inst, &cat, &p, &[], Some("other"), &cancel).await.unwrap();
        assert_eq!(other.data.len(), 3);
        let anonymous = perform_select_with_polling(&inst, &cat, &p, &[], None, &cancel).await.unwrap();
        assert_eq!(anonymous.data.len(), 3);
    }

    #[tokio::test]
    async fn changing_the_query_resets_the_cursor() {
        let timeline = Timeline::new(vec![(1, "a"), (2, "b")], Duration::ZERO, Some("seq"));
        let inst = instance(timeline.clone());
        let (cat, cancel) = (catalog(), CancellationToken::new());
        let p = props(0.0, 1.0, 0.0);
        perform_select_with_polling(&inst, &cat, &p, &[], Some("dash"), &cancel).await.unwrap();

        let narrowed = QueryProperties {
            fields: Some(vec![FieldRef::name("seq"), FieldRef::name("label")]),
            ..p
        };
        let result = perform_select_with_polling(&inst, &cat, &narrowed, &[], Some("dash"), &cancel).await.unwrap();
        assert_eq!(result.data.len(), 2);
    }
}
