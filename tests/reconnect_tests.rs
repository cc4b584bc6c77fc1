// Integration tests for automatic reconnection, driven by tokio's paused clock

mod common;

use std::time::Duration;

use chatwire::config::ClientConfig;
use chatwire::connection::{ConnectParams, ConnectionManager, ReconnectError, ReconnectEvent, Reconnector};
use chatwire::models::ConnectionStatus;
use chatwire::transport::{MemoryServer, MemoryTransport, TransportError};
use common::{accept, drain, events_until, memory_manager, next_event, setup_logging, test_config, ENDPOINT};

fn reconnecting(config: &ClientConfig) -> (ConnectionManager, Reconnector, MemoryTransport, MemoryServer) {
    let (manager, transport, server) = memory_manager(config);
    let reconnector = Reconnector::new(manager.clone(), config.reconnect.clone());
    (manager, reconnector, transport, server)
}

fn scheduled_delays(events: &[ReconnectEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            ReconnectEvent::Scheduled { delay, .. } => Some(delay.as_millis() as u64),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_reconnects_once() {
    setup_logging();
    let (manager, reconnector, transport, mut server) = reconnecting(&test_config());
    let mut rx = reconnector.events().subscribe();

    manager.connect(ENDPOINT, &ConnectParams::new()).await.unwrap();
    let peer = accept(&mut server).await;
    peer.close(4001, "restarting");

    let events = events_until(&mut rx, |e| matches!(e, ReconnectEvent::Reconnected { .. })).await;
    let _peer = accept(&mut server).await;

    assert!(matches!(
        events[0],
        ReconnectEvent::Scheduled { attempt: 1, delay } if delay == Duration::from_millis(100)
    ));
    assert!(matches!(events[1], ReconnectEvent::Attempt { attempt: 1 }));
    assert!(matches!(
        events.last(),
        Some(ReconnectEvent::Reconnected { attempts: 1, .. })
    ));
    assert_eq!(scheduled_delays(&events).len(), 1);

    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(reconnector.attempts(), 0);
    assert_eq!(transport.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_error_and_close_of_one_connection_schedule_one_attempt() {
    setup_logging();
    let (manager, reconnector, transport, mut server) = reconnecting(&test_config());
    let mut rx = reconnector.events().subscribe();

    manager.connect(ENDPOINT, &ConnectParams::new()).await.unwrap();
    let peer = accept(&mut server).await;
    peer.fail(TransportError::Reset("gone".to_string()));

    let events = events_until(&mut rx, |e| matches!(e, ReconnectEvent::Reconnected { .. })).await;
    let _peer = accept(&mut server).await;

    assert_eq!(scheduled_delays(&events), vec![100]);
    assert_eq!(transport.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_clean_close_does_not_reconnect() {
    setup_logging();
    let (manager, reconnector, transport, mut server) = reconnecting(&test_config());
    let mut rx = reconnector.events().subscribe();

    manager.connect(ENDPOINT, &ConnectParams::new()).await.unwrap();
    let peer = accept(&mut server).await;
    peer.close(1000, "goodbye");
    tokio::time::sleep(Duration::from_secs(5)).await;

    // A local close is just as deliberate
    manager.connect(ENDPOINT, &ConnectParams::new()).await.unwrap();
    let _peer = accept(&mut server).await;
    manager.close();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(drain(&mut rx).is_empty());
    assert!(!reconnector.has_pending());
    assert_eq!(transport.attempt_count(), 2);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_until_max_attempts() {
    setup_logging();
    let mut config = test_config();
    config.reconnect.max_attempts = 3;
    let (manager, reconnector, transport, mut server) = reconnecting(&config);
    let mut rx = reconnector.events().subscribe();

    manager.connect(ENDPOINT, &ConnectParams::new()).await.unwrap();
    let peer = accept(&mut server).await;
    for _ in 0..3 {
        transport.refuse_next("server down");
    }
    drop(peer);

    let events = events_until(&mut rx, |e| matches!(e, ReconnectEvent::MaxAttemptsReached { .. })).await;
    assert_eq!(scheduled_delays(&events), vec![100, 200, 400]);

    let names: Vec<&str> = events.iter().map(chatwire::NamedEvent::name).collect();
    assert_eq!(
        names,
        vec![
            "reconnectScheduled",
            "reconnectAttempt",
            "reconnectFailure",
            "reconnectScheduled",
            "reconnectAttempt",
            "reconnectFailure",
            "reconnectScheduled",
            "reconnectAttempt",
            "reconnectFailure",
            "maxAttemptsReached",
        ]
    );
    assert!(matches!(
        events.last(),
        Some(ReconnectEvent::MaxAttemptsReached { attempts: 3 })
    ));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(drain(&mut rx).is_empty());
    assert!(!reconnector.has_pending());
    assert_eq!(transport.attempt_count(), 4);
    assert_eq!(manager.status(), ConnectionStatus::Error);

    // A reset allows a fresh round
    reconnector.reset();
    reconnector.reconnect_now().await.unwrap();
    let _peer = accept(&mut server).await;
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(ReconnectEvent::Attempt { attempt: 1 })));
    assert!(matches!(
        events.last(),
        Some(ReconnectEvent::Reconnected { attempts: 1, .. })
    ));
    assert_eq!(reconnector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_schedules_reconnect() {
    setup_logging();
    let (manager, reconnector, transport, mut server) = reconnecting(&test_config());
    let mut rx = reconnector.events().subscribe();

    transport.hang_next();
    assert!(manager.connect(ENDPOINT, &ConnectParams::new()).await.is_err());

    next_event(&mut rx, |e| matches!(e, ReconnectEvent::Reconnected { .. })).await;
    let _peer = accept(&mut server).await;
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(transport.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_now_replaces_pending_attempt() {
    setup_logging();
    let (manager, reconnector, transport, mut server) = reconnecting(&test_config());
    let mut rx = reconnector.events().subscribe();

    manager.connect(ENDPOINT, &ConnectParams::new()).await.unwrap();
    let peer = accept(&mut server).await;
    peer.close(4001, "restarting");
    next_event(&mut rx, |e| matches!(e, ReconnectEvent::Scheduled { .. })).await;
    assert!(reconnector.has_pending());

    reconnector.reconnect_now().await.unwrap();
    let _peer = accept(&mut server).await;
    assert!(!reconnector.has_pending());
    assert_eq!(manager.status(), ConnectionStatus::Connected);

    // Well past the scheduled delay: the cancelled timer never fires
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.attempt_count(), 2);
    assert!(!reconnector.has_pending());
    let attempts = drain(&mut rx)
        .iter()
        .filter(|e| matches!(e, ReconnectEvent::Attempt { .. }))
        .count();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_reconnect_now_needs_a_target() {
    setup_logging();
    let (_manager, reconnector, transport, _server) = reconnecting(&test_config());

    let err = reconnector.reconnect_now().await.unwrap_err();
    assert!(matches!(err, ReconnectError::NoTarget));
    assert_eq!(transport.attempt_count(), 0);
}

#[tokio::test]
async fn test_reconnect_now_while_connected_is_a_no_op() {
    setup_logging();
    let (manager, reconnector, transport, mut server) = reconnecting(&test_config());
    let mut rx = reconnector.events().subscribe();

    manager.connect(ENDPOINT, &ConnectParams::new()).await.unwrap();
    let _peer = accept(&mut server).await;

    reconnector.reconnect_now().await.unwrap();
    assert_eq!(transport.attempt_count(), 1);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_keeps_endpoint_and_params() {
    setup_logging();
    let (manager, reconnector, transport, mut server) = reconnecting(&test_config());
    let mut rx = reconnector.events().subscribe();

    let mut params = ConnectParams::new();
    params.insert("token".to_string(), "abc".to_string());
    params.insert("conversationId".to_string(), "c-9".to_string());
    manager.connect(ENDPOINT, &params).await.unwrap();
    let peer = accept(&mut server).await;
    drop(peer);

    next_event(&mut rx, |e| matches!(e, ReconnectEvent::Reconnected { .. })).await;
    let peer = accept(&mut server).await;

    let attempts = transport.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], attempts[1]);
    assert_eq!(peer.url.query(), Some("conversationId=c-9&token=abc"));
    assert_eq!(manager.target().unwrap().params, params);
}

#[tokio::test(start_paused = true)]
async fn test_disable_cancels_pending_attempt() {
    setup_logging();
    let (manager, reconnector, transport, mut server) = reconnecting(&test_config());
    let mut rx = reconnector.events().subscribe();

    manager.connect(ENDPOINT, &ConnectParams::new()).await.unwrap();
    let peer = accept(&mut server).await;
    peer.close(4002, "overloaded");
    next_event(&mut rx, |e| matches!(e, ReconnectEvent::Scheduled { .. })).await;
    assert!(reconnector.has_pending());

    reconnector.disable();
    assert!(!reconnector.has_pending());
    assert!(!reconnector.is_enabled());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(transport.attempt_count(), 1);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_reconnector_ignores_losses() {
    setup_logging();
    let mut config = test_config();
    config.reconnect.enabled = false;
    let (manager, reconnector, transport, mut server) = reconnecting(&config);
    let mut rx = reconnector.events().subscribe();

    manager.connect(ENDPOINT, &ConnectParams::new()).await.unwrap();
    drop(accept(&mut server).await);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(drain(&mut rx).is_empty());
    assert_eq!(transport.attempt_count(), 1);

    // Manual reconnects still work
    reconnector.reconnect_now().await.unwrap();
    let _peer = accept(&mut server).await;
    assert_eq!(manager.status(), ConnectionStatus::Connected);
}
