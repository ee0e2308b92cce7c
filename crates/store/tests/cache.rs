#![forbid(unsafe_code)]

use std::time::Duration;

use serde_json::json;
use tether_core::{well_known, ObjectKind};
use tether_store::{Delta, Store, StoreError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn cm(name: &str, value: &str) -> serde_json::Value {
    json!({"metadata": {"name": name, "namespace": "ns", "uid": format!("uid-{name}")}, "data": {"k": value}})
}

async fn store_with(kind: &ObjectKind) -> (Store, mpsc::Sender<Delta>) {
    let (store, _loop) = Store::spawn(CancellationToken::new());
    let (tx, rx) = mpsc::channel(16);
    store.add_informer(kind.clone(), rx).await.unwrap();
    (store, tx)
}

#[tokio::test]
async fn get_returns_deep_copy_with_kind() {
    let kind = well_known::config_map();
    let (store, tx) = store_with(&kind).await;
    tx.send(Delta::Applied(cm("a", "1"))).await.unwrap();

    let mut got = store.get(&kind, "ns", "a").await.unwrap().unwrap();
    assert_eq!(got["kind"], "ConfigMap");
    assert_eq!(got["apiVersion"], "v1");
    assert_eq!(got["data"]["k"], "1");

    // mutate the copy; the cache must not change
    got["data"]["k"] = json!("mutated");
    let again = store.get(&kind, "ns", "a").await.unwrap().unwrap();
    assert_eq!(again["data"]["k"], "1");

    assert_eq!(store.get(&kind, "ns", "missing").await.unwrap(), None);
}

#[tokio::test]
async fn unknown_kind_is_reported() {
    let (store, _tx) = store_with(&well_known::config_map()).await;
    let err = store.get(&well_known::secret(), "ns", "a").await.unwrap_err();
    assert_eq!(err, StoreError::NoInformer(well_known::secret()));
    assert!(err.to_string().contains("no informer registered"));
}

#[tokio::test]
async fn registering_a_kind_twice_is_refused() {
    let kind = well_known::config_map();
    let (store, _tx) = store_with(&kind).await;
    let (_tx2, rx2) = mpsc::channel(1);
    let err = store.add_informer(kind.clone(), rx2).await.unwrap_err();
    assert_eq!(err, StoreError::InformerExists(kind));
}

#[tokio::test]
async fn await_resolves_immediately_when_already_satisfied() {
    let kind = well_known::config_map();
    let (store, tx) = store_with(&kind).await;
    tx.send(Delta::Applied(cm("a", "ready"))).await.unwrap();
    let obj = store
        .await_object_condition(&CancellationToken::new(), None, &kind, "ns", "a", |o| o["data"]["k"] == "ready")
        .await
        .unwrap();
    assert_eq!(obj["data"]["k"], "ready");
    assert_eq!(store.waiter_count().await.unwrap(), 0);
}

#[tokio::test]
async fn await_registered_before_event_resolves_when_it_arrives() {
    let kind = well_known::config_map();
    let (store, tx) = store_with(&kind).await;
    tx.send(Delta::Applied(cm("a", "pending"))).await.unwrap();

    let waiter = {
        let store = store.clone();
        let kind = kind.clone();
        tokio::spawn(async move {
            store
                .await_object_condition(&CancellationToken::new(), None, &kind, "ns", "a", |o| o["data"]["k"] == "done")
                .await
        })
    };
    // wait until the waiter is parked
    for _ in 0..100 {
        if store.waiter_count().await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(store.waiter_count().await.unwrap(), 1);

    tx.send(Delta::Applied(cm("a", "still-pending"))).await.unwrap();
    tx.send(Delta::Applied(cm("a", "done"))).await.unwrap();
    let obj = waiter.await.unwrap().unwrap();
    assert_eq!(obj["data"]["k"], "done");
    assert_eq!(obj["kind"], "ConfigMap");
    assert_eq!(store.waiter_count().await.unwrap(), 0);
}

#[tokio::test]
async fn removing_informer_fails_pending_and_later_waiters() {
    let kind = well_known::config_map();
    let (store, _tx) = store_with(&kind).await;

    let pending = {
        let store = store.clone();
        let kind = kind.clone();
        tokio::spawn(async move {
            store.await_object_condition(&CancellationToken::new(), None, &kind, "ns", "x", |_| true).await
        })
    };
    for _ in 0..100 {
        if store.waiter_count().await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    store.remove_informer(&kind).await.unwrap();
    assert_eq!(pending.await.unwrap().unwrap_err(), StoreError::InformerRemoved(kind.clone()));

    let after = store.await_object_condition(&CancellationToken::new(), None, &kind, "ns", "x", |_| true).await;
    assert_eq!(after.unwrap_err(), StoreError::InformerRemoved(kind.clone()));
    assert_eq!(store.get(&kind, "ns", "x").await.unwrap_err(), StoreError::InformerRemoved(kind.clone()));
    assert_eq!(store.list(&kind, None).await.unwrap_err(), StoreError::InformerRemoved(kind.clone()));

    let other = well_known::secret();
    assert_eq!(store.get(&other, "ns", "x").await.unwrap_err(), StoreError::NoInformer(other));

    let (_tx, rx) = mpsc::channel(8);
    store.add_informer(kind.clone(), rx).await.unwrap();
    assert_eq!(store.get(&kind, "ns", "x").await.unwrap(), None);
}

#[tokio::test]
async fn lapsed_deadline_leaves_no_registration() {
    let kind = well_known::config_map();
    let (store, _tx) = store_with(&kind).await;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(20);
    let res = store
        .await_object_condition(&CancellationToken::new(), Some(deadline), &kind, "ns", "never", |_| true)
        .await;
    assert_eq!(res.unwrap_err(), StoreError::DeadlineExceeded);
    assert_eq!(store.waiter_count().await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_ends_wait_and_deregisters() {
    let kind = well_known::config_map();
    let (store, _tx) = store_with(&kind).await;
    let cancel = CancellationToken::new();
    let waiter = {
        let store = store.clone();
        let kind = kind.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { store.await_object_condition(&cancel, None, &kind, "ns", "never", |_| true).await })
    };
    for _ in 0..100 {
        if store.waiter_count().await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();
    assert_eq!(waiter.await.unwrap().unwrap_err(), StoreError::Cancelled);
    assert_eq!(store.waiter_count().await.unwrap(), 0);
}

#[tokio::test]
async fn restart_replaces_cache_and_reports_deletions() {
    let kind = well_known::config_map();
    let (store, tx) = store_with(&kind).await;
    tx.send(Delta::Applied(cm("a", "1"))).await.unwrap();
    tx.send(Delta::Applied(cm("b", "1"))).await.unwrap();
    let mut events = store.subscribe().unwrap();
    // round trip so the subscription is in place before the relist
    store.kinds().await.unwrap();

    tx.send(Delta::Restarted(vec![cm("b", "2"), cm("c", "1")])).await.unwrap();
    let names: Vec<String> = store
        .list(&kind, Some("ns"))
        .await
        .unwrap()
        .iter()
        .map(|o| o["metadata"]["name"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(names, vec!["b", "c"]);

    let mut deleted = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if ev.deleted {
            deleted.push(ev.object["metadata"]["name"].as_str().unwrap_or_default().to_string());
        }
    }
    assert_eq!(deleted, vec!["a"]);
}

#[tokio::test]
async fn controlled_objects_are_found_across_kinds() {
    let (store, _loop) = Store::spawn(CancellationToken::new());
    let (cm_tx, cm_rx) = mpsc::channel(8);
    let (sec_tx, sec_rx) = mpsc::channel(8);
    store.add_informer(well_known::config_map(), cm_rx).await.unwrap();
    store.add_informer(well_known::secret(), sec_rx).await.unwrap();

    let owned = |name: &str, uid: &str| {
        json!({"metadata": {"name": name, "namespace": "ns", "ownerReferences": [
            {"apiVersion": "tether.dev/v1", "kind": "Bundle", "name": "b", "uid": uid, "controller": true}
        ]}})
    };
    cm_tx.send(Delta::Applied(owned("c1", "b-1"))).await.unwrap();
    cm_tx.send(Delta::Applied(owned("c2", "other"))).await.unwrap();
    sec_tx.send(Delta::Applied(owned("s1", "b-1"))).await.unwrap();

    let found = store.list_controlled_by("ns", "b-1").await.unwrap();
    let got: Vec<(String, String)> = found
        .iter()
        .map(|(k, o)| (k.kind.clone(), o["metadata"]["name"].as_str().unwrap_or_default().to_string()))
        .collect();
    assert_eq!(got, vec![("ConfigMap".into(), "c1".into()), ("Secret".into(), "s1".into())]);
    assert_eq!(store.kinds().await.unwrap().len(), 2);
}
