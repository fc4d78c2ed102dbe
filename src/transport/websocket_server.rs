use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::common::errors::RelayError;
use crate::common::types::{DriverId, SubscriberId, now_ms};
use crate::monitoring::collect_stats;
use crate::protocol::messages::{DashboardMessage, DriverMessage, OutgoingMessage};
use crate::protocol::topic::Topic;
use crate::relay::delivery;
use crate::relay::registry::{
    CloseReason, ControlCommand, PublisherSession, SubscriberSession,
};
use crate::relay::router::OutboundQueue;
use crate::relay::store::{DriverStatus, UpdateOutcome};
use crate::server::AppState;

/// Repeated malformed or invalid frames before the connection is dropped.
/// One-off validation failures never terminate the handling path.
const MAX_PROTOCOL_STRIKES: u32 = 5;

fn check_password(
    headers: &HeaderMap,
    state: &AppState,
) -> Result<(), (StatusCode, &'static str)> {
    let auth_header = headers.get("authorization").and_then(|h| h.to_str().ok());
    match auth_header {
        Some(auth) if auth == state.config.server.password => Ok(()),
        Some(_) => {
            warn!("WS authorization failed: invalid password");
            Err((StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
        None => {
            warn!("WS authorization failed: missing Authorization header");
            Err((StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
    }
}

fn required_header(
    headers: &HeaderMap,
    name: &'static str,
) -> Result<String, (StatusCode, &'static str)> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or((StatusCode::BAD_REQUEST, "Missing identity header"))
}

/// GET /ws/driver — publisher handshake. The auth collaborator has already
/// verified the identity carried in `Driver-Id`.
pub async fn driver_ws_handler(
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Result<Response, (StatusCode, &'static str)> {
    check_password(&headers, &state)?;
    let driver_id = DriverId::from(required_header(&headers, "driver-id")?);

    Ok(ws
        .on_upgrade(move |socket| handle_driver_socket(socket, state, driver_id))
        .into_response())
}

async fn handle_driver_socket(mut socket: WebSocket, state: Arc<AppState>, driver_id: DriverId) {
    let (control_tx, control_rx) = flume::unbounded();

    let session = match state.registry.register_publisher(driver_id.clone(), control_tx) {
        Ok(session) => session,
        Err(err) => {
            // Reject policy: the old connection stays, this one is refused.
            warn!("driver handshake refused: {}", err);
            let refuse = OutgoingMessage::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            };
            if let Ok(json) = serde_json::to_string(&refuse) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    info!(
        "driver connected: {} connection={}",
        driver_id, session.connection_id
    );

    let ready = OutgoingMessage::Ready {
        connection_id: session.connection_id.clone(),
    };
    if let Ok(json) = serde_json::to_string(&ready) {
        let _ = socket.send(Message::Text(json.into())).await;
    }

    let mut close_reason = CloseReason::ClientClosed;
    let mut strikes: u32 = 0;

    loop {
        tokio::select! {
            Ok(ControlCommand::Close(reason)) = control_rx.recv_async() => {
                close_reason = reason;
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            msg = socket.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket error: driver={} err={}", driver_id, e);
                        close_reason = CloseReason::ProtocolError;
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => match serde_json::from_str::<DriverMessage>(&text) {
                        Ok(op) => {
                            session.touch();
                            handle_driver_op(op, &state, &session, &mut strikes);
                        }
                        Err(e) => {
                            strikes += 1;
                            warn!("bad driver frame from {}: {}", driver_id, e);
                        }
                    },
                    Message::Ping(_) | Message::Pong(_) => session.touch(),
                    Message::Close(_) => break,
                    _ => {}
                }

                if strikes >= MAX_PROTOCOL_STRIKES {
                    warn!("closing driver {} after repeated invalid frames", driver_id);
                    close_reason = CloseReason::ProtocolError;
                    break;
                }
            }
        }
    }

    state.registry.close(&session.connection_id, close_reason);
}

fn handle_driver_op(
    op: DriverMessage,
    state: &Arc<AppState>,
    session: &Arc<PublisherSession>,
    strikes: &mut u32,
) {
    match op {
        DriverMessage::Location {
            driver_id,
            lat,
            lng,
            reported_at,
        } => {
            if driver_id != session.driver_id {
                warn!(
                    "driver {} published as {}, dropping",
                    session.driver_id, driver_id
                );
                *strikes += 1;
                return;
            }
            let received_at = now_ms();
            // The observed tracking clients send no timestamp; arrival time
            // stands in, which degrades staleness ordering to arrival order.
            let reported_at = reported_at.unwrap_or(received_at);
            match state.store.update(
                driver_id,
                lat,
                lng,
                reported_at,
                received_at,
                DriverStatus::EnRoute,
            ) {
                UpdateOutcome::Accepted(record) => state.router.fanout_location(&record),
                UpdateOutcome::Rejected(crate::relay::store::RejectReason::Stale) => {
                    // Logged by the store, not surfaced to the publisher.
                }
                UpdateOutcome::Rejected(crate::relay::store::RejectReason::InvalidCoordinate) => {
                    *strikes += 1;
                }
            }
        }
        DriverMessage::DeliveryComplete {
            driver_id,
            lat,
            lng,
            point_id,
        } => {
            if driver_id != session.driver_id {
                warn!(
                    "driver {} completed as {}, dropping",
                    session.driver_id, driver_id
                );
                *strikes += 1;
                return;
            }
            delivery::handle_delivery_complete(state, driver_id, lat, lng, point_id);
        }
        DriverMessage::Heartbeat => {
            // Liveness already recorded by the caller.
        }
    }
}

/// GET /ws/dashboard — subscriber handshake. Capacity is enforced before the
/// upgrade so an over-capacity client is refused at handshake time.
pub async fn dashboard_ws_handler(
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Result<Response, (StatusCode, &'static str)> {
    check_password(&headers, &state)?;
    let subscriber_id = SubscriberId::from(required_header(&headers, "subscriber-id")?);

    let (control_tx, control_rx) = flume::unbounded();
    let queue = OutboundQueue::new(
        state.config.relay.subscriber_queue_capacity,
        state.config.relay.event_backlog_limit,
    );
    let session = match state
        .registry
        .register_subscriber(subscriber_id, queue, control_tx)
    {
        Ok(session) => session,
        Err(RelayError::CapacityExceeded) => {
            return Err((StatusCode::SERVICE_UNAVAILABLE, "Subscriber capacity exceeded"));
        }
        Err(err) => {
            warn!("dashboard handshake refused: {}", err);
            return Err((StatusCode::BAD_REQUEST, "Handshake refused"));
        }
    };

    Ok(ws
        .on_upgrade(move |socket| handle_dashboard_socket(socket, state, session, control_rx))
        .into_response())
}

async fn handle_dashboard_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    session: Arc<SubscriberSession>,
    control_rx: flume::Receiver<ControlCommand>,
) {
    info!(
        "dashboard connected: {} connection={}",
        session.subscriber_id, session.connection_id
    );

    let ready = OutgoingMessage::Ready {
        connection_id: session.connection_id.clone(),
    };
    if let Ok(json) = serde_json::to_string(&ready) {
        let _ = socket.send(Message::Text(json.into())).await;
    }

    let mut stats_interval = tokio::time::interval(std::time::Duration::from_secs(
        state.config.relay.stats_interval_secs,
    ));
    stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut close_reason = CloseReason::ClientClosed;
    let mut strikes: u32 = 0;

    loop {
        tokio::select! {
            Ok(ControlCommand::Close(reason)) = control_rx.recv_async() => {
                close_reason = reason;
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            msg = session.queue.pop() => {
                if let Ok(json) = serde_json::to_string(&msg) {
                    if let Err(e) = socket.send(Message::Text(json.into())).await {
                        warn!(
                            "socket send error: subscriber={} err={}",
                            session.subscriber_id, e
                        );
                        break;
                    }
                }
            }
            _ = stats_interval.tick() => {
                session.queue.push(OutgoingMessage::Stats(collect_stats(&state)));
            }
            msg = socket.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(
                            "WebSocket error: subscriber={} err={}",
                            session.subscriber_id, e
                        );
                        close_reason = CloseReason::ProtocolError;
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => match serde_json::from_str::<DashboardMessage>(&text) {
                        Ok(op) => {
                            session.touch();
                            handle_dashboard_op(op, &state, &session, &mut strikes);
                        }
                        Err(e) => {
                            strikes += 1;
                            warn!("bad dashboard frame from {}: {}", session.subscriber_id, e);
                        }
                    },
                    Message::Ping(_) | Message::Pong(_) => session.touch(),
                    Message::Close(_) => break,
                    _ => {}
                }

                if strikes >= MAX_PROTOCOL_STRIKES {
                    warn!(
                        "closing subscriber {} after repeated invalid frames",
                        session.subscriber_id
                    );
                    close_reason = CloseReason::ProtocolError;
                    break;
                }
            }
        }
    }

    state.router.unsubscribe_all(&session);
    state.registry.close(&session.connection_id, close_reason);
}

fn handle_dashboard_op(
    op: DashboardMessage,
    state: &Arc<AppState>,
    session: &Arc<SubscriberSession>,
    strikes: &mut u32,
) {
    match op {
        DashboardMessage::Subscribe { topic } => match Topic::parse(&topic) {
            Ok(topic) => {
                state.router.subscribe(topic.clone(), session.clone());
                // Initial sync: the current snapshot flows through the same
                // queue, ahead of live fan-out.
                match &topic {
                    Topic::AllDrivers => {
                        for record in state.store.list_all() {
                            session.queue.push(OutgoingMessage::location_update(&record));
                        }
                    }
                    Topic::Driver(driver_id) => {
                        if let Some(record) = state.store.get(driver_id) {
                            session.queue.push(OutgoingMessage::location_update(&record));
                        }
                    }
                }
            }
            Err(err) => {
                *strikes += 1;
                session.queue.push(OutgoingMessage::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
            }
        },
        DashboardMessage::Unsubscribe { topic } => match Topic::parse(&topic) {
            Ok(topic) => state.router.unsubscribe(&topic, session),
            Err(err) => {
                *strikes += 1;
                session.queue.push(OutgoingMessage::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
            }
        },
        DashboardMessage::Heartbeat => {
            // Liveness already recorded by the caller.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn state() -> Arc<AppState> {
        let (state, events) = AppState::new(Config::default());
        std::mem::forget(events);
        Arc::new(state)
    }

    fn subscriber(state: &Arc<AppState>, id: &str) -> Arc<SubscriberSession> {
        let (ctl_tx, _ctl_rx) = flume::unbounded();
        std::mem::forget(_ctl_rx);
        state
            .registry
            .register_subscriber(
                SubscriberId::from(id),
                OutboundQueue::new(16, 16),
                ctl_tx,
            )
            .unwrap()
    }

    #[test]
    fn subscribe_to_global_topic_syncs_current_records() {
        let state = state();
        state.store.update(
            DriverId::from("d1"),
            37.5,
            127.0,
            100,
            100,
            DriverStatus::EnRoute,
        );
        state.store.update(
            DriverId::from("d2"),
            35.1,
            129.0,
            100,
            100,
            DriverStatus::Delayed,
        );

        let session = subscriber(&state, "dash");
        let mut strikes = 0;
        handle_dashboard_op(
            DashboardMessage::Subscribe {
                topic: "/hypelink/gps".to_string(),
            },
            &state,
            &session,
            &mut strikes,
        );

        assert_eq!(session.queue.len(), 2);
        assert_eq!(state.router.subscriber_count(&Topic::AllDrivers), 1);
        assert_eq!(strikes, 0);
    }

    #[test]
    fn malformed_topic_is_surfaced_as_protocol_error() {
        let state = state();
        let session = subscriber(&state, "dash");
        let mut strikes = 0;
        handle_dashboard_op(
            DashboardMessage::Subscribe {
                topic: "not-a-destination".to_string(),
            },
            &state,
            &session,
            &mut strikes,
        );

        assert_eq!(strikes, 1);
        assert!(matches!(
            session.queue.try_pop().unwrap(),
            OutgoingMessage::Error { ref code, .. } if code == "UNKNOWN_TOPIC"
        ));
    }

    #[test]
    fn publishing_under_a_foreign_driver_id_is_dropped() {
        let state = state();
        let (ctl_tx, _ctl_rx) = flume::unbounded();
        let session = state
            .registry
            .register_publisher(DriverId::from("d1"), ctl_tx)
            .unwrap();

        let mut strikes = 0;
        handle_driver_op(
            DriverMessage::Location {
                driver_id: DriverId::from("d2"),
                lat: 1.0,
                lng: 1.0,
                reported_at: None,
            },
            &state,
            &session,
            &mut strikes,
        );

        assert_eq!(strikes, 1);
        assert!(state.store.get(&DriverId::from("d2")).is_none());
    }

    #[test]
    fn accepted_location_is_fanned_out_to_global_subscribers() {
        let state = state();
        let dash = subscriber(&state, "dash");
        state.router.subscribe(Topic::AllDrivers, dash.clone());

        let (ctl_tx, _ctl_rx) = flume::unbounded();
        let session = state
            .registry
            .register_publisher(DriverId::from("d1"), ctl_tx)
            .unwrap();

        let mut strikes = 0;
        handle_driver_op(
            DriverMessage::Location {
                driver_id: DriverId::from("d1"),
                lat: 37.5,
                lng: 127.0,
                reported_at: Some(100),
            },
            &state,
            &session,
            &mut strikes,
        );

        assert!(matches!(
            dash.queue.try_pop().unwrap(),
            OutgoingMessage::LocationUpdate { latitude, .. } if latitude == 37.5
        ));
    }

    #[test]
    fn invalid_coordinates_count_toward_protocol_strikes() {
        let state = state();
        let (ctl_tx, _ctl_rx) = flume::unbounded();
        let session = state
            .registry
            .register_publisher(DriverId::from("d1"), ctl_tx)
            .unwrap();

        let mut strikes = 0;
        handle_driver_op(
            DriverMessage::Location {
                driver_id: DriverId::from("d1"),
                lat: 120.0,
                lng: 0.0,
                reported_at: None,
            },
            &state,
            &session,
            &mut strikes,
        );
        assert_eq!(strikes, 1);
        assert!(state.store.get(&DriverId::from("d1")).is_none());
    }
}
