use axum::extract::{Path, State};
use axum::Json;
use bytes::Bytes;
use metrics::counter;
use tracing::instrument;
use uuid::Uuid;

use relay_common::event::{ProcessedEvent, RawEvent, RawRequest};

use crate::api::{ApiError, EventsResponse, LookupResponse, LookupStatus};
use crate::router;

#[instrument(skip_all, fields(batch_size))]
pub async fn events(
    state: State<router::State>,
    body: Bytes,
) -> Result<Json<EventsResponse>, ApiError> {
    let events = RawRequest::from_bytes(&body)?;

    tracing::Span::current().record("batch_size", events.len());

    if events.is_empty() {
        return Err(ApiError::EmptyBatch);
    }

    counter!("relay_events_received_total").increment(events.len() as u64);

    let events: Vec<ProcessedEvent> = events
        .into_iter()
        .map(process_single_event)
        .collect::<Result<Vec<ProcessedEvent>, ApiError>>()?;

    let request_ids = events.iter().map(|e| e.request_id.clone()).collect();

    tracing::debug!(events=?events, "decoded request");

    if events.len() == 1 {
        state.sink.send(events[0].clone()).await?;
    } else {
        state.sink.send_batch(events).await?;
    }

    Ok(Json(EventsResponse { request_ids }))
}

/// Assign a request id where the caller did not supply one. The id is
/// generated here, at the producer boundary, and is immutable afterwards:
/// the consumer side never invents ids, so the key under which a response is
/// persisted always matches what this endpoint returned.
pub fn process_single_event(mut event: RawEvent) -> Result<ProcessedEvent, ApiError> {
    let request_id = event
        .request_id
        .clone()
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    event.request_id = Some(request_id.clone());

    let data = serde_json::to_string(&event).map_err(|e| {
        tracing::error!("failed to encode event: {}", e);
        ApiError::NonRetryableSinkError
    })?;

    Ok(ProcessedEvent { request_id, data })
}

#[instrument(skip(state))]
pub async fn response_lookup(
    state: State<router::State>,
    Path(request_id): Path<String>,
) -> Result<Json<LookupResponse>, ApiError> {
    match state.store.fetch(&request_id).await {
        Ok(Some(response)) => Ok(Json(LookupResponse {
            status: LookupStatus::Completed,
            response: Some(response),
        })),
        Ok(None) => Ok(Json(LookupResponse {
            status: LookupStatus::Processing,
            response: None,
        })),
        Err(e) => {
            tracing::error!("failed to fetch response for {}: {}", request_id, e);
            Err(ApiError::StoreUnavailable)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use relay_common::event::RawEvent;

    use super::process_single_event;

    fn raw_event(request_id: Option<&str>) -> RawEvent {
        RawEvent {
            request_id: request_id.map(String::from),
            messages: vec![json!({"role": "user", "content": "hi"})],
            extra: HashMap::from([(String::from("temperature"), json!(0.2))]),
        }
    }

    #[test]
    fn keeps_the_request_id_the_caller_supplied() {
        let processed = process_single_event(raw_event(Some("r1"))).unwrap();

        assert_eq!(processed.request_id, "r1");
        assert_eq!(processed.key(), "r1");
    }

    #[test]
    fn assigns_a_request_id_when_absent() {
        let processed = process_single_event(raw_event(None)).unwrap();

        assert!(!processed.request_id.is_empty());

        // The assigned id travels inside the produced payload too
        let payload: serde_json::Value = serde_json::from_str(&processed.data).unwrap();
        assert_eq!(payload["request_id"], json!(processed.request_id));
        assert_eq!(payload["temperature"], json!(0.2));
    }
}
