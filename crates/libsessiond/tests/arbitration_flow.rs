//! Multi-context arbitration through the public client API.
//!
//! Every context gets its own `SessionsClient` over a `LocalChannel` sharing a
//! single background, the same topology the server gives socket clients.

use std::sync::Arc;

use libsessiond::{LocalChannel, SessionsBackground, SessionsClient, ServiceConfig};
use sessiond_protocol::{DescriptorApiLevel, ErrorCode, Event, PathInternal};

async fn contexts(n: usize) -> Vec<SessionsClient<LocalChannel>> {
    let first = LocalChannel::new(SessionsBackground::create(ServiceConfig::default()));
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let channel = LocalChannel::from_shared(Arc::clone(first.shared())).await;
        out.push(SessionsClient::new(channel).with_caller(format!("ctx-{i}")));
    }
    out
}

#[tokio::test]
async fn concurrent_acquires_grant_exactly_one_owner() {
    let clients = Arc::new(contexts(8).await);
    clients[0]
        .enumerate_done(vec![DescriptorApiLevel::new("usb-1")])
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..clients.len() {
        let clients = Arc::clone(&clients);
        handles.push(tokio::spawn(async move {
            clients[i].acquire("1", None, None).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(payload) => winners.push(payload.session),
            Err(err) => assert_eq!(err.code(), Some(ErrorCode::SessionWrongPrevious)),
        }
    }
    assert_eq!(winners.len(), 1);

    let sessions = clients[0].get_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session.as_ref(), Some(&winners[0]));
    assert_eq!(
        clients[0].get_path_by_session(winners[0].clone()).await.unwrap(),
        PathInternal::from("usb-1")
    );
}

#[tokio::test]
async fn interleaved_handoff_cannot_steal_pending_acquire() {
    let clients = contexts(2).await;
    let (tab_a, tab_b) = (&clients[0], &clients[1]);
    tab_a
        .enumerate_done(vec![DescriptorApiLevel::new("usb-1")])
        .await
        .unwrap();

    // tab_a is between intent and done, opening the device.
    let pending = tab_a.acquire_intent("1", None).await.unwrap();
    let err = tab_b
        .acquire_intent("1", Some(pending.session.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::SessionWrongPrevious));

    let finished = tab_a
        .acquire_done(pending.path.clone(), Some(pending.session.clone()), None)
        .await
        .unwrap();
    assert_eq!(finished.session, pending.session);

    // Once done, the ordinary hand-off goes through.
    let taken = tab_b
        .acquire("1", Some(pending.session.clone()), None)
        .await
        .unwrap();
    let err = tab_a
        .acquire_done(pending.path, Some(pending.session), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::SessionWrongPrevious));
    assert_eq!(
        tab_b.get_sessions().await.unwrap()[0].session.as_ref(),
        Some(&taken.session)
    );
}

#[tokio::test]
async fn handoff_between_contexts_notifies_previous_owner() {
    let clients = contexts(2).await;
    let (tab_a, tab_b) = (&clients[0], &clients[1]);

    tab_a
        .enumerate_done(vec![
            DescriptorApiLevel::new("usb-1"),
            DescriptorApiLevel::new("usb-2"),
        ])
        .await
        .unwrap();

    let owned = tab_a.acquire("1", None, None).await.unwrap();
    let mut a_events = tab_a.subscribe();

    // tab_b saw the current snapshot and names the session it is replacing.
    let snapshot = tab_b.get_sessions().await.unwrap();
    let previous = snapshot[0].session.clone();
    assert_eq!(previous.as_deref(), Some(owned.session.as_str()));
    assert_eq!(snapshot[0].session_owner.as_deref(), Some("ctx-0"));

    let taken = tab_b.acquire("1", previous, None).await.unwrap();
    assert_ne!(taken.session, owned.session);

    let release = loop {
        match a_events.recv().await.unwrap() {
            Event::ReleaseRequest(descriptor) => break descriptor,
            Event::Descriptors(_) => continue,
        }
    };
    assert_eq!(release.session.as_deref(), Some(owned.session.as_str()));

    let err = tab_a.get_path_by_session(owned.session).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::SessionNotFound));
    assert_eq!(
        tab_b.get_path_by_session(taken.session).await.unwrap(),
        PathInternal::from("usb-1")
    );
}

#[tokio::test]
async fn unplugged_device_drops_its_session() {
    let clients = contexts(1).await;
    let ctx = &clients[0];

    ctx.enumerate_done(vec![
        DescriptorApiLevel::new("usb-1"),
        DescriptorApiLevel::new("usb-2"),
    ])
    .await
    .unwrap();
    let first = ctx.acquire("1", None, None).await.unwrap();
    let second = ctx.acquire("2", None, None).await.unwrap();

    let descriptors = ctx
        .enumerate_done(vec![DescriptorApiLevel::new("usb-2")])
        .await
        .unwrap();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].path.as_str(), "2");
    assert_eq!(descriptors[0].session, Some(second.session.clone()));

    let err = ctx.get_path_by_session(first.session).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::SessionNotFound));

    // Re-plugged devices get a fresh public path.
    let descriptors = ctx
        .enumerate_done(vec![
            DescriptorApiLevel::new("usb-2"),
            DescriptorApiLevel::new("usb-1"),
        ])
        .await
        .unwrap();
    let replugged = descriptors
        .iter()
        .find(|d| d.path.as_str() != "2")
        .unwrap();
    assert_eq!(replugged.path.as_str(), "3");
    assert!(replugged.session.is_none());
}

#[tokio::test]
async fn dispose_frees_every_device() {
    let clients = contexts(2).await;
    clients[0]
        .enumerate_done(vec![
            DescriptorApiLevel::new("usb-1"),
            DescriptorApiLevel::new("usb-2"),
        ])
        .await
        .unwrap();
    clients[0].acquire("1", None, None).await.unwrap();
    clients[1].acquire("2", None, None).await.unwrap();

    clients[1].dispose().await.unwrap();

    let sessions = clients[0].get_sessions().await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|d| d.session.is_none()));

    // Free again: acquiring needs no previous session.
    clients[0].acquire_intent("2", None).await.unwrap();
}
