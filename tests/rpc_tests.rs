mod common;

use livenode::rpc::registrants;
use livenode::{AccessPolicy, Node, NodeError, Value};
use std::time::Duration;

#[tokio::test]
async fn proxy_reads_remote_node_and_follows_its_updates() {
    common::local(async {
        let host = common::context();
        let client = common::context();
        host.start().await.unwrap();
        client.start().await.unwrap();

        let ada = common::owner(&host, "ada");
        let gear = common::widget(&host, "gear", Some(&ada));
        let proxy = Node::proxy(&client, &gear.url().to_string()).await.unwrap();
        assert!(proxy.is_proxy());
        assert_eq!(proxy.type_name(), "Widget");
        assert!(gear.has_registrant(&proxy.url().to_string()));
        assert_eq!(
            registrants::persisted(host.db(), &gear.url().to_string()).unwrap(),
            vec![(proxy.url().to_string(), "proxy".to_string())]
        );

        let name = proxy.fetch("name").await.unwrap();
        assert_eq!(name.value(), Some(&Value::from("gear")));
        assert_eq!(proxy.cached(), vec!["name".to_string()]);

        let owner = proxy.fetch("owner").await.unwrap().into_node().unwrap();
        assert!(owner.is_proxy());
        assert_eq!(owner.fetch("name").await.unwrap().value(), Some(&Value::from("ada")));

        gear.set("name", "cog").unwrap();
        gear.update(&["name"]).await.unwrap();
        assert_eq!(proxy.cached(), vec!["owner".to_string()]);
        assert_eq!(proxy.fetch("name").await.unwrap().value(), Some(&Value::from("cog")));
    })
    .await;
}

#[tokio::test]
async fn invalidation_crosses_processes_transitively() {
    common::local(async {
        let host = common::context();
        let client = common::context();
        host.start().await.unwrap();
        client.start().await.unwrap();

        let ada = common::owner(&host, "ada");
        let gear = common::widget(&host, "gear", Some(&ada));
        let proxy = Node::proxy(&client, &gear.url().to_string()).await.unwrap();
        let owner = proxy.fetch("owner").await.unwrap().into_node().unwrap();
        assert_eq!(owner.fetch("name").await.unwrap().value(), Some(&Value::from("ada")));
        assert_eq!(proxy.cached(), vec!["owner".to_string()]);
        assert_eq!(gear.cached(), vec!["owner".to_string()]);

        ada.set("name", "grace").unwrap();
        ada.update(&["name"]).await.unwrap();

        assert!(gear.cached().is_empty());
        assert!(proxy.cached().is_empty());
        let owner = proxy.fetch("owner").await.unwrap().into_node().unwrap();
        assert_eq!(owner.fetch("name").await.unwrap().value(), Some(&Value::from("grace")));
    })
    .await;
}

#[tokio::test]
async fn proxies_reject_writes() {
    common::local(async {
        let host = common::context();
        let client = common::context();
        host.start().await.unwrap();
        client.start().await.unwrap();

        let gear = common::widget(&host, "gear", None);
        let proxy = Node::proxy(&client, &gear.url().to_string()).await.unwrap();
        assert!(matches!(proxy.set("name", "cog"), Err(NodeError::Integrity(_))));
        assert!(matches!(proxy.update(&["name"]).await, Err(NodeError::Integrity(_))));
        assert!(matches!(proxy.delete().await, Err(NodeError::Integrity(_))));
        assert!(matches!(proxy.get("name"), Err(NodeError::Usage(_))));
    })
    .await;
}

#[tokio::test]
async fn dropped_proxy_deregisters_through_the_sweep() {
    common::local(async {
        let host = common::context();
        let client = common::context();
        host.start().await.unwrap();
        client.start().await.unwrap();

        let gear = common::widget(&host, "gear", None);
        let proxy = Node::proxy(&client, &gear.url().to_string()).await.unwrap();
        let proxy_url = proxy.url().to_string();
        assert_eq!(gear.registrant_count(), 1);

        drop(proxy);
        assert_eq!(client.deferred_len(), 1);
        assert_eq!(client.sweep().await, 1);
        assert!(!gear.has_registrant(&proxy_url));
        assert!(registrants::persisted(host.db(), &gear.url().to_string())
            .unwrap()
            .is_empty());
    })
    .await;
}

#[tokio::test]
async fn reads_from_a_vanished_node_are_dead() {
    common::local(async {
        let host = common::context();
        let client = common::context();
        host.start().await.unwrap();
        client.start().await.unwrap();

        let gear = common::widget(&host, "gear", None);
        let proxy = Node::proxy(&client, &gear.url().to_string()).await.unwrap();
        drop(gear);

        assert!(matches!(proxy.fetch("name").await, Err(NodeError::Dead(_))));
        assert!(proxy.cached().is_empty());
    })
    .await;
}

#[tokio::test]
async fn dead_registrants_are_dropped_on_notify() {
    common::local(async {
        let host = common::context();
        let client = common::context();
        host.start().await.unwrap();
        client.start().await.unwrap();

        let gear = common::widget(&host, "gear", None);
        let proxy = Node::proxy(&client, &gear.url().to_string()).await.unwrap();
        assert_eq!(gear.registrant_count(), 1);

        // The client goes away before its deferred deregistration is swept.
        drop(proxy);
        assert_eq!(client.deferred_len(), 1);
        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        gear.set("name", "cog").unwrap();
        gear.update(&["name"]).await.unwrap();
        assert_eq!(gear.registrant_count(), 0);
    })
    .await;
}

#[tokio::test]
async fn access_policy_guards_the_router() {
    common::local(async {
        let guarded = common::context_with(common::config().with_environment_id("host-env")).unwrap();
        let client = common::context_with(common::config().with_environment_id("client-env")).unwrap();
        guarded.start().await.unwrap();
        client.start().await.unwrap();

        let gear = common::widget(&guarded, "gear", None);
        match Node::proxy(&client, &gear.url().to_string()).await {
            Err(NodeError::Remote(message)) => assert!(message.contains("Access denied")),
            other => panic!("expected an access error, got {:?}", other),
        }
        assert_eq!(gear.registrant_count(), 0);

        let open = common::context_with(
            common::config()
                .with_environment_id("open-env")
                .with_access(AccessPolicy::Open),
        )
        .unwrap();
        open.start().await.unwrap();
        let cog = common::widget(&open, "cog", None);
        let proxy = Node::proxy(&client, &cog.url().to_string()).await.unwrap();
        assert_eq!(proxy.fetch("name").await.unwrap().value(), Some(&Value::from("cog")));
    })
    .await;
}
