//! Integration tests for the broadcast protocol over the in-memory hub.
//!
//! These cover the end-to-end flows of the directed-signal path: export
//! propagation, the request-endpoints handshake, isolate loss, and the
//! concurrency discipline of the repository under protocol load.

mod common;

use std::collections::BTreeSet;

use common::{directory_for, hub_isolate, registration_with_endpoint, SignalHub};
use larch::broadcast::ServiceNotification;
use larch::model::{PROP_EXPORTED_INTENTS, PROP_INTENTS};
use serde_json::json;

#[tokio::test]
async fn export_propagates_to_all_other_isolates() {
    let hub = SignalHub::new();
    let directory = directory_for(&["iso-x", "iso-y", "iso-z"]);
    let x = hub_isolate(&hub, "iso-x", directory.clone());
    let y = hub_isolate(&hub, "iso-y", directory.clone());
    let z = hub_isolate(&hub, "iso-z", directory);

    let mut y_events = y.subscribe();

    x.export_service(registration_with_endpoint("svc-calc", "iso-x"))
        .await
        .unwrap();

    for peer in [&y, &z] {
        let imported = peer
            .repository()
            .remote_registration("iso-x", "svc-calc")
            .expect("registration should reach every peer");
        // The importing side resolved the host through its own directory.
        assert_eq!(imported.endpoints[0].host.as_deref(), Some("host-iso-x"));
    }

    match y_events.recv().await.unwrap() {
        ServiceNotification::Appeared { registration } => {
            assert_eq!(registration.service_id, "svc-calc");
            assert_eq!(registration.sender, "iso-x");
        }
        other => panic!("expected Appeared, got {other:?}"),
    }
}

#[tokio::test]
async fn unexport_propagates_as_lost() {
    let hub = SignalHub::new();
    let directory = directory_for(&["iso-x", "iso-y"]);
    let x = hub_isolate(&hub, "iso-x", directory.clone());
    let y = hub_isolate(&hub, "iso-y", directory);

    x.export_service(registration_with_endpoint("svc-calc", "iso-x"))
        .await
        .unwrap();
    assert_eq!(y.repository().remote_registrations().len(), 1);

    let mut y_events = y.subscribe();
    assert!(x.unexport_service("svc-calc").await);
    assert!(y.repository().remote_registrations().is_empty());
    assert!(matches!(
        y_events.recv().await.unwrap(),
        ServiceNotification::Lost { .. }
    ));

    // Unexporting twice is a no-op, nothing reaches the peers.
    assert!(!x.unexport_service("svc-calc").await);
}

/// Scenario A: isolate Y becomes ready and asks X for its endpoints.
#[tokio::test]
async fn ready_isolate_requests_endpoints() {
    let hub = SignalHub::new();
    let directory = directory_for(&["iso-x", "iso-y"]);
    let x = hub_isolate(&hub, "iso-x", directory.clone());

    // X exports before Y exists; Y never saw the REGISTERED signal.
    x.export_service(registration_with_endpoint("svc-calc", "iso-x"))
        .await
        .unwrap();

    let y = hub_isolate(&hub, "iso-y", directory);
    assert!(y.repository().remote_registrations().is_empty());

    y.isolate_ready("iso-x").await;

    let imported = y
        .repository()
        .remote_registration("iso-x", "svc-calc")
        .expect("request-endpoints should import the service");
    assert_eq!(
        imported.exported_interfaces,
        BTreeSet::from(["calc".to_string()])
    );

    // An isolate with nothing exported answers with silence.
    y.isolate_ready("iso-y").await; // self: ignored
    let x_view_before = x.repository().remote_registrations().len();
    x.isolate_ready("iso-y").await;
    assert_eq!(x.repository().remote_registrations().len(), x_view_before);
}

/// Scenario B: a lost isolate looks exactly like one that unregistered.
#[tokio::test]
async fn lost_isolate_purges_only_its_registrations() {
    let hub = SignalHub::new();
    let directory = directory_for(&["iso-x", "iso-y", "iso-z"]);
    let x = hub_isolate(&hub, "iso-x", directory.clone());
    let z = hub_isolate(&hub, "iso-z", directory.clone());
    let y = hub_isolate(&hub, "iso-y", directory);

    for id in ["svc-1", "svc-2", "svc-3"] {
        x.export_service(registration_with_endpoint(id, "iso-x"))
            .await
            .unwrap();
    }
    z.export_service(registration_with_endpoint("svc-z", "iso-z"))
        .await
        .unwrap();
    assert_eq!(y.repository().remote_registrations().len(), 4);

    let mut y_events = y.subscribe();
    y.isolate_lost("iso-x");

    let mut lost = Vec::new();
    for _ in 0..3 {
        match y_events.recv().await.unwrap() {
            ServiceNotification::Lost { sender, service_id } => {
                assert_eq!(sender, "iso-x");
                lost.push(service_id);
            }
            other => panic!("expected Lost, got {other:?}"),
        }
    }
    lost.sort();
    assert_eq!(lost, ["svc-1", "svc-2", "svc-3"]);

    // Nothing else is queued and iso-z's registration survived.
    assert!(y_events.try_recv().is_err());
    assert_eq!(y.repository().remote_registrations().len(), 1);
}

#[tokio::test]
async fn send_failure_skips_target_and_continues() {
    let hub = SignalHub::new();
    let directory = directory_for(&["iso-x", "iso-y", "iso-z"]);
    let x = hub_isolate(&hub, "iso-x", directory.clone());
    let _y = hub_isolate(&hub, "iso-y", directory.clone());
    let z = hub_isolate(&hub, "iso-z", directory);

    // iso-y vanished without being declared lost.
    hub.disconnect("host-iso-y:1");

    x.export_service(registration_with_endpoint("svc-calc", "iso-x"))
        .await
        .unwrap();

    // The broadcast still reached iso-z.
    assert!(z
        .repository()
        .remote_registration("iso-x", "svc-calc")
        .is_some());
}

#[tokio::test]
async fn update_service_carries_changed_subset() {
    let hub = SignalHub::new();
    let directory = directory_for(&["iso-x", "iso-y"]);
    let x = hub_isolate(&hub, "iso-x", directory.clone());
    let y = hub_isolate(&hub, "iso-y", directory);

    x.export_service(registration_with_endpoint("svc-calc", "iso-x"))
        .await
        .unwrap();
    let mut y_events = y.subscribe();

    let changes = common::fixtures::props(&[("service.ranking", json!(9))]);
    assert!(x.update_service("svc-calc", changes).await);

    match y_events.recv().await.unwrap() {
        ServiceNotification::Modified {
            registration,
            changed_properties,
        } => {
            assert_eq!(registration.service_id, "svc-calc");
            let changed = changed_properties.expect("changed subset expected");
            assert_eq!(changed.get("service.ranking"), Some(&json!(9)));
        }
        other => panic!("expected Modified, got {other:?}"),
    }

    let imported = y
        .repository()
        .remote_registration("iso-x", "svc-calc")
        .unwrap();
    assert_eq!(
        imported.service_properties.get("service.ranking"),
        Some(&json!(9))
    );
}

#[tokio::test]
async fn intents_gate_export_against_transport_guarantees() {
    let hub = SignalHub::with_intents(["confidentiality".to_string()]);
    let directory = directory_for(&["iso-x", "iso-y"]);
    let x = hub_isolate(&hub, "iso-x", directory.clone());
    let y = hub_isolate(&hub, "iso-y", directory);

    // Requires an intent the transport provides: exported.
    let mut reg = registration_with_endpoint("svc-ok", "iso-x");
    reg.service_properties
        .insert(PROP_EXPORTED_INTENTS.into(), json!("confidentiality"));
    x.export_service(reg).await.unwrap();
    assert!(y
        .repository()
        .remote_registration("iso-x", "svc-ok")
        .is_some());

    // Requires an intent nobody provides: refused, nothing propagates.
    let mut reg = registration_with_endpoint("svc-bad", "iso-x");
    reg.service_properties
        .insert(PROP_EXPORTED_INTENTS.into(), json!(["exactly-once"]));
    assert!(x.export_service(reg).await.is_err());
    assert!(y
        .repository()
        .remote_registration("iso-x", "svc-bad")
        .is_none());

    // A service providing its own required intent passes regardless.
    let mut reg = registration_with_endpoint("svc-self", "iso-x");
    reg.service_properties
        .insert(PROP_EXPORTED_INTENTS.into(), json!("replay-protection"));
    reg.service_properties
        .insert(PROP_INTENTS.into(), json!(["replay-protection"]));
    x.export_service(reg).await.unwrap();
    let imported = y
        .repository()
        .remote_registration("iso-x", "svc-self")
        .unwrap();
    assert!(imported.provided_intents.contains("replay-protection"));
}

/// Scenario D: concurrent exports and merges complete without lost updates.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_exports_and_inbound_merges() {
    let hub = SignalHub::new();
    let directory = directory_for(&["iso-x", "iso-y"]);
    let x = hub_isolate(&hub, "iso-x", directory.clone());
    let y = hub_isolate(&hub, "iso-y", directory);

    let a = {
        let x = x.clone();
        tokio::spawn(async move {
            x.export_service(registration_with_endpoint("svc-a", "iso-x"))
                .await
                .unwrap();
        })
    };
    let b = {
        let x = x.clone();
        tokio::spawn(async move {
            x.export_service(registration_with_endpoint("svc-b", "iso-x"))
                .await
                .unwrap();
        })
    };
    let c = {
        let y = y.clone();
        tokio::spawn(async move {
            let mut reg = registration_with_endpoint("svc-c", "iso-y");
            reg.sender = "iso-peer".into();
            // Already resolved: comes straight from another transport.
            reg.endpoints[0].resolve_host("10.0.0.9");
            y.ingest_event(larch::model::RemoteServiceEvent::Registered { registration: reg })
                .await;
        })
    };
    let (ra, rb, rc) = tokio::join!(a, b, c);
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let x_local: BTreeSet<String> = x
        .repository()
        .local_registrations()
        .into_iter()
        .map(|r| r.service_id)
        .collect();
    assert_eq!(
        x_local,
        BTreeSet::from(["svc-a".to_string(), "svc-b".to_string()])
    );

    let y_remote: BTreeSet<String> = y
        .repository()
        .remote_registrations()
        .into_iter()
        .map(|r| r.service_id)
        .collect();
    assert_eq!(
        y_remote,
        BTreeSet::from([
            "svc-a".to_string(),
            "svc-b".to_string(),
            "svc-c".to_string()
        ])
    );
}
