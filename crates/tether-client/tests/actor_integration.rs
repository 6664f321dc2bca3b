#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the connection actor.
//!
//! Every test runs on a paused clock, so retry pauses and debounce windows
//! elapse instantly while keeping their ordering.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use tether_client::testing::{DialOutcome, ScriptedDialer};
use tether_client::{
    ActorError, ActorState, ChannelTarget, ChannelTicket, ConnectionActor, DialConfig,
    InboundRequest, InvariantHook, InvariantViolation,
};
use tether_core::{ConnectionConfig, EndpointId, ReconnectTower, Scope};

fn alice() -> EndpointId {
    EndpointId::new("alice", "10.0.0.5:22", "bastion")
}

fn settings(attempts: u32) -> ConnectionConfig {
    ConnectionConfig {
        reconnect_attempts: attempts,
        ..Default::default()
    }
}

/// Hook that records violations instead of aborting.
fn recording_hook() -> (InvariantHook, Arc<Mutex<Vec<InvariantViolation>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let hook: InvariantHook = Arc::new(move |v: &InvariantViolation| {
        sink.lock().unwrap().push(v.clone());
    });
    (hook, seen)
}

async fn spawn_actor(dialer: &Arc<ScriptedDialer>, settings: ConnectionConfig) -> ConnectionActor {
    let (hook, _) = recording_hook();
    let config = DialConfig::new(alice(), Arc::clone(dialer) as _)
        .with_settings(settings)
        .on_invariant_violation(hook);
    ConnectionActor::create(config, None, "test").await.unwrap()
}

/// Step past the reconnect debounce window.
async fn past_debounce() {
    tokio::time::sleep(Duration::from_millis(1500)).await;
}

#[tokio::test(start_paused = true)]
async fn connects_after_transient_refusals() {
    let dialer = Arc::new(ScriptedDialer::new());
    dialer.refuse(2);

    let started = Instant::now();
    let actor = spawn_actor(&dialer, settings(10)).await;
    let elapsed = started.elapsed();

    assert_eq!(dialer.attempts(), 3);
    assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");

    let client = actor.get_client().await.unwrap();
    assert_eq!(client.metadata().user(), "alice");
    let status = actor.status();
    assert_eq!(status.state, ActorState::Connected);
    assert_eq!(status.generation, 1);
}

#[tokio::test(start_paused = true)]
async fn create_fails_when_attempts_exhausted() {
    let dialer = Arc::new(ScriptedDialer::new());
    dialer.refuse_forever(true);
    let parent = Scope::new();

    let config = DialConfig::new(alice(), Arc::clone(&dialer) as _).with_settings(settings(3));
    let err = ConnectionActor::create(config, Some(&parent), "test")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ActorError::ReconnectExhausted { attempts: 3, .. }
    ));
    assert_eq!(dialer.attempts(), 3);
    assert_eq!(parent.child_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_during_retry_pause_aborts_create() {
    let dialer = Arc::new(ScriptedDialer::new());
    dialer.refuse_forever(true);
    let parent = Scope::new();

    let creating = {
        let config = DialConfig::new(alice(), Arc::clone(&dialer) as _);
        let parent = parent.clone();
        tokio::spawn(async move { ConnectionActor::create(config, Some(&parent), "test").await })
    };
    tokio::time::sleep(Duration::from_millis(2500)).await;
    parent.request_stop();

    let err = creating.await.unwrap().unwrap_err();
    assert!(err.is_shutting_down());
    assert!(dialer.attempts() < 10);
}

#[tokio::test(start_paused = true)]
async fn forward_channel_is_opened_and_tracked() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(3)).await;

    let handle = actor
        .request_channel(ChannelTarget::Forward(" 127.0.0.1:9000 ".into()))
        .await
        .unwrap();
    let transport = dialer.last_transport().unwrap();
    assert_eq!(transport.dialed(), vec!["127.0.0.1:9000".to_string()]);
    assert_eq!(actor.status().open_channels, 1);

    handle.send(b"hello").await.unwrap();
    assert_eq!(handle.recv().await.unwrap(), Some(b"hello".to_vec()));

    assert!(actor.close_channel(&handle).await.unwrap());
    assert!(!actor.close_channel(&handle).await.unwrap());
    assert!(transport.channels()[0].is_closed());
    assert_eq!(actor.status().open_channels, 0);
}

#[tokio::test(start_paused = true)]
async fn named_stream_drains_requests_and_answers_keepalives() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(3)).await;

    let handle = actor
        .request_channel(ChannelTarget::NamedStream)
        .await
        .unwrap();
    assert_eq!(handle.target(), &ChannelTarget::NamedStream);

    let transport = dialer.last_transport().unwrap();
    assert_eq!(transport.opened(), vec!["custom-inproc-stream".to_string()]);

    let requests = transport.request_sender().unwrap();
    let (keepalive, keepalive_reply) =
        InboundRequest::new("keepalive@openssh.com", true, Vec::new());
    let (other, other_reply) = InboundRequest::new("exec", true, Vec::new());
    requests.send(keepalive).await.unwrap();
    requests.send(other).await.unwrap();

    assert!(keepalive_reply.await.unwrap().ok);
    assert!(!other_reply.await.unwrap().ok);
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_applied_to_new_channels() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(
        &dialer,
        ConnectionConfig {
            channel_idle_timeout_secs: 30,
            ..settings(3)
        },
    )
    .await;

    actor
        .request_channel(ChannelTarget::Forward("127.0.0.1:9000".into()))
        .await
        .unwrap();
    let channels = dialer.last_transport().unwrap().channels();
    assert_eq!(channels[0].idle_timeout(), Some(Duration::from_secs(30)));
}

#[tokio::test(start_paused = true)]
async fn reconnect_replaces_session_and_closes_channels() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(3)).await;

    let first = actor.get_client().await.unwrap();
    actor
        .request_channel(ChannelTarget::NamedStream)
        .await
        .unwrap();
    actor
        .request_channel(ChannelTarget::Forward("127.0.0.1:9000".into()))
        .await
        .unwrap();
    let old_transport = dialer.last_transport().unwrap();

    past_debounce().await;
    actor.notify_reconnect_needed(alice()).await.unwrap();
    // Commands are serviced in order, so this observes the new session.
    let second = actor.get_client().await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(first.is_closed());
    assert_eq!(old_transport.shutdown_count(), 1);
    assert!(old_transport.channels().iter().all(|c| c.is_closed()));

    let status = actor.status();
    assert_eq!(status.generation, 2);
    assert_eq!(status.open_channels, 0);
}

#[tokio::test(start_paused = true)]
async fn notification_within_debounce_is_ignored() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(3)).await;
    let first = actor.get_client().await.unwrap();

    actor.notify_reconnect_needed(alice()).await.unwrap();
    let second = actor.get_client().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(dialer.attempts(), 1);
    assert_eq!(actor.status().generation, 1);
}

#[tokio::test(start_paused = true)]
async fn tower_notification_triggers_reconnect() {
    let dialer = Arc::new(ScriptedDialer::new());
    let tower = ReconnectTower::new("test");
    let config = DialConfig::new(alice(), Arc::clone(&dialer) as _)
        .with_settings(settings(3))
        .with_notifications(tower.clone());
    let actor = ConnectionActor::create(config, None, "test").await.unwrap();
    assert_eq!(tower.subscriber_count(), 1);

    past_debounce().await;
    let report = tower.publish(alice());
    assert_eq!(report.delivered, 1);

    let mut status = actor.watch_status();
    status
        .wait_for(|s| s.generation == 2 && s.state == ActorState::Connected)
        .await
        .unwrap();

    actor.shutdown();
    actor.wait().await;
    assert_eq!(tower.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_reconnect_leaves_actor_disconnected() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(3)).await;

    dialer.refuse_forever(true);
    past_debounce().await;
    actor.notify_reconnect_needed(alice()).await.unwrap();

    assert!(matches!(
        actor.get_client().await,
        Err(ActorError::NotConnected(_))
    ));
    assert!(matches!(
        actor.get_closer().await,
        Err(ActorError::NotConnected(_))
    ));
    assert_eq!(actor.status().state, ActorState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn channel_request_reconnects_implicitly() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(3)).await;

    dialer.refuse(3);
    past_debounce().await;
    actor.notify_reconnect_needed(alice()).await.unwrap();

    // The reconnect above exhausts the three queued refusals; the ticket's
    // own reconnect then succeeds.
    let handle = actor
        .request_channel(ChannelTarget::Forward("127.0.0.1:9000".into()))
        .await
        .unwrap();
    assert_eq!(handle.target(), &ChannelTarget::Forward("127.0.0.1:9000".into()));
    assert_eq!(actor.status().state, ActorState::Connected);
}

#[tokio::test(start_paused = true)]
async fn channel_request_fails_when_implicit_reconnect_exhausts() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(3)).await;

    dialer.refuse_forever(true);
    past_debounce().await;
    actor.notify_reconnect_needed(alice()).await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(60),
        actor.request_channel(ChannelTarget::Forward("127.0.0.1:9000".into())),
    )
    .await
    .unwrap();
    assert!(matches!(
        result,
        Err(ActorError::ReconnectExhausted { .. })
    ));

    // The actor keeps serving requests.
    assert!(matches!(
        actor.get_client().await,
        Err(ActorError::NotConnected(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn abandoned_ticket_is_skipped() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(3)).await;

    let (ticket, pending) = ChannelTicket::new(ChannelTarget::Forward("127.0.0.1:1".into()));
    drop(pending);
    actor.submit(ticket).await.unwrap();
    actor
        .request_channel(ChannelTarget::Forward("127.0.0.1:2".into()))
        .await
        .unwrap();

    let transport = dialer.last_transport().unwrap();
    assert_eq!(transport.dialed(), vec!["127.0.0.1:2".to_string()]);
    assert_eq!(actor.status().open_channels, 1);
}

#[tokio::test(start_paused = true)]
async fn mismatched_notification_invokes_hook_and_stops() {
    let dialer = Arc::new(ScriptedDialer::new());
    let (hook, seen) = recording_hook();
    let config = DialConfig::new(alice(), Arc::clone(&dialer) as _)
        .with_settings(settings(3))
        .on_invariant_violation(hook);
    let actor = ConnectionActor::create(config, None, "test").await.unwrap();

    let bob = EndpointId::new("bob", "10.0.0.6:22", "");
    actor.notify_reconnect_needed(bob.clone()).await.unwrap();
    actor.wait().await;

    assert_eq!(
        seen.lock().unwrap().clone(),
        vec![InvariantViolation::IdentityMismatch {
            expected: alice(),
            got: bob,
        }]
    );
    assert!(actor.get_client().await.unwrap_err().is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn missing_user_routes_through_hook() {
    let dialer = Arc::new(ScriptedDialer::new());
    let (hook, seen) = recording_hook();
    let config = DialConfig::new(EndpointId::new("", "10.0.0.5:22", ""), Arc::clone(&dialer) as _)
        .on_invariant_violation(hook);

    let err = ConnectionActor::create(config, None, "test")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ActorError::Invariant(InvariantViolation::MissingConfig(_))
    ));
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(dialer.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_identity_is_not_retried() {
    let dialer = Arc::new(ScriptedDialer::new());
    dialer.script([DialOutcome::UnknownIdentity]);

    let config = DialConfig::new(alice(), Arc::clone(&dialer) as _).with_settings(settings(5));
    let err = ConnectionActor::create(config, None, "test")
        .await
        .unwrap_err();

    assert!(matches!(err, ActorError::Dial { .. }));
    assert_eq!(dialer.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_identity_accepted_only_once() {
    let dialer = Arc::new(ScriptedDialer::new());
    dialer.script([DialOutcome::UnknownIdentity]);

    let config = DialConfig::new(alice(), Arc::clone(&dialer) as _)
        .with_settings(settings(5))
        .accept_new_identity_once(true);
    let actor = ConnectionActor::create(config, None, "test").await.unwrap();
    assert_eq!(dialer.accept_flags(), vec![false, true]);

    dialer.script([DialOutcome::UnknownIdentity]);
    past_debounce().await;
    actor.notify_reconnect_needed(alice()).await.unwrap();

    assert!(matches!(
        actor.get_client().await,
        Err(ActorError::NotConnected(_))
    ));
    assert_eq!(dialer.accept_flags(), vec![false, true, false]);
}

#[tokio::test(start_paused = true)]
async fn handshake_failures_are_retried() {
    let dialer = Arc::new(ScriptedDialer::new());
    dialer.script([DialOutcome::Fail("ssh: handshake failed: EOF".into())]);

    spawn_actor(&dialer, settings(3)).await;
    assert_eq!(dialer.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_later_requests() {
    let dialer = Arc::new(ScriptedDialer::new());
    let parent = Scope::new();
    let config = DialConfig::new(alice(), Arc::clone(&dialer) as _).with_settings(settings(3));
    let actor = ConnectionActor::create(config, Some(&parent), "test")
        .await
        .unwrap();
    assert_eq!(parent.child_count(), 1);

    actor
        .request_channel(ChannelTarget::NamedStream)
        .await
        .unwrap();
    let transport = dialer.last_transport().unwrap();

    assert!(actor.shutdown());
    assert!(!actor.shutdown());
    actor.wait().await;

    assert!(
        actor
            .request_channel(ChannelTarget::NamedStream)
            .await
            .unwrap_err()
            .is_shutting_down()
    );
    assert!(actor.get_closer().await.err().unwrap().is_shutting_down());
    assert_eq!(transport.shutdown_count(), 1);
    assert!(transport.channels().iter().all(|c| c.is_closed()));
    assert_eq!(parent.child_count(), 0);
    assert_eq!(actor.status().state, ActorState::ShuttingDown);
}

#[tokio::test(start_paused = true)]
async fn parent_stop_cascades_into_actor() {
    let dialer = Arc::new(ScriptedDialer::new());
    let parent = Scope::new();
    let config = DialConfig::new(alice(), Arc::clone(&dialer) as _).with_settings(settings(3));
    let actor = ConnectionActor::create(config, Some(&parent), "test")
        .await
        .unwrap();

    parent.request_stop();
    tokio::time::timeout(Duration::from_secs(5), actor.wait())
        .await
        .unwrap();
    assert_eq!(dialer.last_transport().unwrap().shutdown_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_getters_see_one_session() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(3)).await;

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let actor = actor.clone();
            tokio::spawn(async move { actor.get_client().await.unwrap() })
        })
        .collect();

    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }
    assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
    assert_eq!(dialer.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn channels_after_reconnect_use_new_client() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(3)).await;

    let before = actor
        .request_channel(ChannelTarget::Forward("127.0.0.1:8000".into()))
        .await
        .unwrap();

    // One refusal keeps the reconnect in flight while the requests queue up.
    dialer.refuse(1);
    past_debounce().await;
    actor.notify_reconnect_needed(alice()).await.unwrap();

    let channels: Vec<_> = (9000..9008)
        .map(|port| {
            let actor = actor.clone();
            tokio::spawn(async move {
                actor
                    .request_channel(ChannelTarget::Forward(format!("127.0.0.1:{port}")))
                    .await
            })
        })
        .collect();
    let clients: Vec<_> = (0..8)
        .map(|_| {
            let actor = actor.clone();
            tokio::spawn(async move { actor.get_client().await })
        })
        .collect();

    let mut handles = Vec::new();
    for task in channels {
        handles.push(task.await.unwrap().unwrap());
    }
    let mut seen = Vec::new();
    for task in clients {
        seen.push(task.await.unwrap().unwrap());
    }

    let transports = dialer.transports();
    assert_eq!(transports.len(), 2);
    assert_eq!(dialer.attempts(), 3);

    assert_eq!(transports[0].dialed(), vec!["127.0.0.1:8000".to_string()]);
    assert!(transports[0].channels().iter().all(|c| c.is_closed()));
    assert!(!actor.close_channel(&before).await.unwrap());

    let mut dialed = transports[1].dialed();
    dialed.sort();
    let expected: Vec<String> = (9000..9008).map(|p| format!("127.0.0.1:{p}")).collect();
    assert_eq!(dialed, expected);
    assert!(transports[1].channels().iter().all(|c| !c.is_closed()));

    assert!(seen.iter().all(|c| Arc::ptr_eq(c, &seen[0])));
    assert!(!seen[0].is_closed());
    let status = actor.status();
    assert_eq!(status.generation, 2);
    assert_eq!(status.open_channels, handles.len());
}

#[tokio::test(start_paused = true)]
async fn queued_requests_fail_once_stop_is_requested() {
    let dialer = Arc::new(ScriptedDialer::new());
    let actor = spawn_actor(&dialer, settings(5)).await;

    dialer.refuse_forever(true);
    past_debounce().await;
    actor.notify_reconnect_needed(alice()).await.unwrap();

    let queued_channel = {
        let actor = actor.clone();
        tokio::spawn(async move { actor.request_channel(ChannelTarget::NamedStream).await })
    };
    let queued_client = {
        let actor = actor.clone();
        tokio::spawn(async move { actor.get_client().await })
    };
    // Let both requests queue behind the stalled reconnect.
    tokio::time::sleep(Duration::from_millis(500)).await;

    actor.shutdown();
    assert!(queued_channel.await.unwrap().unwrap_err().is_shutting_down());
    assert!(queued_client.await.unwrap().unwrap_err().is_shutting_down());
    actor.wait().await;
    assert_eq!(actor.status().state, ActorState::ShuttingDown);
}
