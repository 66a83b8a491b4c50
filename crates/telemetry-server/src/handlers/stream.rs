use std::time::Duration;

use actix_web::web;
use actix_web_lab::{sse, util::InfallibleStream};
use telemetry_engine::{EngineEvent, EngineHandle, Subscription};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::Result;
use crate::state::AppState;

const STREAM_BUFFER: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(15);
/// A client that cannot take one event in this long is treated as gone.
const CLIENT_STALL_LIMIT: Duration = Duration::from_secs(30);

/// `GET /api/stream`: `metrics-init` first, then one event per mutation.
pub async fn stream_events(
    state: web::Data<AppState>,
) -> Result<sse::Sse<InfallibleStream<ReceiverStream<sse::Event>>>> {
    let subscription = state.engine.subscribe().await?;
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);

    actix_web::rt::spawn(forward_events(state.engine.clone(), subscription, tx));

    Ok(sse::Sse::from_infallible_receiver(rx).with_keep_alive(KEEP_ALIVE))
}

async fn forward_events(
    engine: EngineHandle,
    mut subscription: Subscription,
    tx: mpsc::Sender<sse::Event>,
) {
    let id = subscription.id;
    tracing::info!(subscriber = %id, "Dashboard client connected");

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                let Some(event) = event else { break };
                let Some(message) = to_sse_event(&event) else { continue };
                match tokio::time::timeout(CLIENT_STALL_LIMIT, tx.send(message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        tracing::warn!(subscriber = %id, "Dashboard client stalled, closing stream");
                        break;
                    }
                }
            }
            _ = tx.closed() => break,
        }
    }

    if let Err(error) = engine.unsubscribe(id).await {
        tracing::debug!(subscriber = %id, "Unsubscribe skipped: {}", error);
    }
    tracing::info!(subscriber = %id, "Dashboard client disconnected");
}

/// Render an engine event as a named SSE message carrying the event's payload.
pub fn to_sse_event(event: &EngineEvent) -> Option<sse::Event> {
    let data = match event {
        EngineEvent::Init(snapshot) => sse::Data::new_json(snapshot.as_ref()),
        EngineEvent::MetricUpdate(update) => sse::Data::new_json(update),
        EngineEvent::SessionCountUpdate(update) => sse::Data::new_json(update),
        EngineEvent::ActivityUpdate(activity) => sse::Data::new_json(activity),
        EngineEvent::LogUpdate(update) => sse::Data::new_json(update),
    };

    match data {
        Ok(data) => Some(sse::Event::Data(data.event(event.name()))),
        Err(error) => {
            tracing::warn!("Failed to encode {} event: {}", event.name(), error);
            None
        }
    }
}
