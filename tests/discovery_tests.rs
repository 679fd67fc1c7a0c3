mod common;

use livenode::rpc::discovery;
use livenode::schema::migrator::DISCOVERABLE_TABLE;
use livenode::{Node, NodeError, ReadOptions, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn by_name(ctx: &livenode::Context, name: &str) -> Node {
    Node::search(ctx, "Owner")
        .index("by_name")
        .key(name)
        .run()
        .expect("Failed to find owner")
}

#[tokio::test]
async fn second_live_registration_is_a_duplicate() {
    common::local(async {
        let ctx = common::context();
        common::owner(&ctx, "ada");

        let first = by_name(&ctx, "ada");
        first.set_discoverable(true).unwrap();
        assert!(first.is_discoverable());

        let second = by_name(&ctx, "ada");
        assert!(matches!(
            second.set_discoverable(true),
            Err(NodeError::DuplicateDiscoverable(_))
        ));
        assert!(!second.is_discoverable());

        first.set_discoverable(false).unwrap();
        second.set_discoverable(true).unwrap();
        assert!(second.is_discoverable());
    })
    .await;
}

#[tokio::test]
async fn dropping_a_discoverable_node_withdraws_it() {
    common::local(async {
        let ctx = common::context();
        common::owner(&ctx, "ada");

        let first = by_name(&ctx, "ada");
        let semantic = first.infname_semantic().unwrap();
        first.set_discoverable(true).unwrap();
        assert_eq!(
            discovery::lookup(&ctx, &semantic).unwrap(),
            Some(first.url().to_string())
        );

        drop(first);
        assert_eq!(discovery::lookup(&ctx, &semantic).unwrap(), None);
        by_name(&ctx, "ada").set_discoverable(true).unwrap();
    })
    .await;
}

#[tokio::test]
async fn stale_registration_is_evicted_and_its_owner_stops() {
    common::local(async {
        let dir = tempfile::tempdir().unwrap();
        let reasons = Rc::new(RefCell::new(Vec::<String>::new()));
        let seen = Rc::clone(&reasons);
        let crashed = common::builder(common::config_in(dir.path()).with_discovery_timing(20, Some(5_000)))
            .unwrap()
            .on_fatal(move |reason| seen.borrow_mut().push(reason.to_string()))
            .build()
            .unwrap();
        let rival = common::context_with(common::config_in(dir.path())).unwrap();

        common::owner(&crashed, "ada");
        let old = by_name(&crashed, "ada");
        old.set_discoverable(true).unwrap();

        // Age the row as if its process had stopped beating.
        let table = crashed.db().qualified(DISCOVERABLE_TABLE);
        crashed
            .db()
            .execute(
                &format!("UPDATE {} SET \"heartbeat\" = \"heartbeat\" - 3600", table),
                &[],
            )
            .unwrap();
        let semantic = old.infname_semantic().unwrap();
        assert_eq!(discovery::lookup(&rival, &semantic).unwrap(), None);

        let new = by_name(&rival, "ada");
        new.set_discoverable(true).unwrap();
        assert_eq!(
            discovery::lookup(&rival, &semantic).unwrap(),
            Some(new.url().to_string())
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let reasons = reasons.borrow();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("vanished"));
    })
    .await;
}

#[tokio::test]
async fn idle_registration_times_out() {
    common::local(async {
        let ctx = common::context_with(common::config().with_discovery_timing(20, Some(60))).unwrap();
        common::owner(&ctx, "ada");

        let idle = by_name(&ctx, "ada");
        idle.set_discoverable(true).unwrap();
        let semantic = idle.infname_semantic().unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!idle.is_discoverable());
        assert_eq!(discovery::lookup(&ctx, &semantic).unwrap(), None);
    })
    .await;
}

#[tokio::test]
async fn registrants_keep_a_registration_alive() {
    common::local(async {
        let host = common::context_with(common::config().with_discovery_timing(20, Some(60))).unwrap();
        host.start().await.unwrap();
        common::owner(&host, "ada");

        let ada = by_name(&host, "ada");
        ada.set_discoverable(true).unwrap();
        let proxy = Node::proxy(&host, &ada.url().to_string()).await.unwrap();
        assert_eq!(ada.registrant_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(ada.is_discoverable());
        drop(proxy);
    })
    .await;
}

#[tokio::test]
async fn discover_returns_a_proxy_of_the_live_node() {
    common::local(async {
        let dir = tempfile::tempdir().unwrap();
        let host = common::context_with(common::config_in(dir.path())).unwrap();
        let client = common::context_with(common::config_in(dir.path())).unwrap();
        host.start().await.unwrap();
        client.start().await.unwrap();

        common::owner(&host, "ada");
        let ada = by_name(&host, "ada");
        ada.set_discoverable(true).unwrap();

        let found = Node::discover(&client, "Owner", "by_name", "ada").await.unwrap();
        assert!(found.is_proxy());
        assert_eq!(found.remote_url().unwrap().to_string(), ada.url().to_string());
        assert_eq!(found.fetch("name").await.unwrap().value(), Some(&Value::from("ada")));

        let missing = Node::discover(&client, "Owner", "by_name", "grace").await;
        assert!(matches!(missing, Err(ref e) if e.is_retrieval()));
    })
    .await;
}

#[tokio::test]
async fn registration_made_before_start_points_at_its_own_process() {
    common::local(async {
        let dir = tempfile::tempdir().unwrap();
        let host = common::context_with(common::config_in(dir.path())).unwrap();
        let client =
            common::context_with(common::config_in(dir.path()).with_request_timeout(200)).unwrap();
        client.start().await.unwrap();
        let _bob = common::owner(&client, "bob");
        let _carl = common::owner(&client, "carl");

        common::owner(&host, "ada");
        let ada = by_name(&host, "ada");
        ada.set_discoverable(true).unwrap();
        assert_eq!(ada.url().endpoint, host.endpoint());
        assert_ne!(host.endpoint(), client.endpoint());

        // The host has not started serving yet.
        let early = Node::discover(&client, "Owner", "by_name", "ada").await;
        assert!(matches!(early, Err(NodeError::Remote(_))));

        host.start().await.unwrap();
        let found = Node::discover(&client, "Owner", "by_name", "ada").await.unwrap();
        assert_eq!(found.remote_url().unwrap().to_string(), ada.url().to_string());
        assert_eq!(found.fetch("name").await.unwrap().value(), Some(&Value::from("ada")));
    })
    .await;
}

#[tokio::test]
async fn broadcast_reaches_listeners_elsewhere() {
    common::local(async {
        let dir = tempfile::tempdir().unwrap();
        let writer = common::context_with(common::config_in(dir.path())).unwrap();
        let reader = common::context_with(common::config_in(dir.path())).unwrap();
        writer.start().await.unwrap();
        reader.start().await.unwrap();

        let watch = Node::all(&reader, "Widget").unwrap();
        watch.listen().unwrap();
        assert!(watch.is_listening());
        assert!(watch.is_empty());

        common::widget(&writer, "gear", None);
        let all = Node::all(&writer, "Widget").unwrap();
        all.refresh(ReadOptions {
            allow_empty: true,
            broadcast: true,
        })
        .await
        .unwrap();

        assert_eq!(all.len(), 1);
        assert_eq!(watch.len(), 1);
        assert_eq!(watch.get("name").unwrap(), Value::from("gear"));
    })
    .await;
}
