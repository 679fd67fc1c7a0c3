mod common;

use livenode::rpc::registrants;
use livenode::{Node, Value};

#[tokio::test]
async fn owner_update_clears_dependent_references() {
    common::local(async {
        let ctx = common::context();
        let ada = common::owner(&ctx, "ada");
        let gear = common::widget(&ctx, "gear", Some(&ada));
        assert!(ada.has_registrant(&gear.url().to_string()));

        gear.resolve("owner").unwrap();
        assert_eq!(gear.cached(), vec!["owner".to_string()]);

        ada.set("name", "grace").unwrap();
        ada.update(&["name"]).await.unwrap();
        assert!(gear.cached().is_empty());

        let owner = gear.resolve("owner").unwrap().unwrap();
        assert_eq!(owner.get("name").unwrap(), Value::from("grace"));
    })
    .await;
}

#[tokio::test]
async fn invalidation_travels_through_chains() {
    common::local(async {
        let ctx = common::context();
        let wales = Node::new(&ctx, "Country", [("name", Value::from("Wales"))]).unwrap();
        wales.create(true).unwrap();
        let cardiff = Node::new(&ctx, "City", [("name", Value::from("Cardiff"))]).unwrap();
        cardiff.set_node("country", &wales).unwrap();
        cardiff.create(true).unwrap();
        let street = Node::new(&ctx, "Street", [("name", Value::from("Queen St"))]).unwrap();
        street.set_node("city", &cardiff).unwrap();
        street.create(true).unwrap();

        let city = street.resolve("city").unwrap().unwrap();
        let country = city.resolve("country").unwrap().unwrap();
        assert_eq!(street.cached(), vec!["city".to_string()]);
        assert_eq!(city.cached(), vec!["country".to_string()]);

        let handled = common::CITY_CHANGES.with(|c| c.get());
        country.set("name", "Cymru").unwrap();
        country.update(&["name"]).await.unwrap();

        assert!(city.cached().is_empty());
        assert!(street.cached().is_empty());
        assert_eq!(common::CITY_CHANGES.with(|c| c.get()), handled + 1);
    })
    .await;
}

#[tokio::test]
async fn notification_scope_holds_back_and_coalesces() {
    common::local(async {
        let ctx = common::context();
        let ada = common::owner(&ctx, "ada");
        let gear = common::widget(&ctx, "gear", Some(&ada));
        gear.resolve("owner").unwrap();

        let scope = ctx.notification_scope();
        ada.set("name", "grace").unwrap();
        ada.update(&["name"]).await.unwrap();
        ada.set("name", "hedy").unwrap();
        ada.update(&["name"]).await.unwrap();
        assert_eq!(ctx.pending_notifications(), 1);
        assert_eq!(gear.cached(), vec!["owner".to_string()]);

        scope.flush().await.unwrap();
        assert_eq!(ctx.pending_notifications(), 0);
        assert!(gear.cached().is_empty());
    })
    .await;
}

#[tokio::test]
async fn deleting_a_window_tells_its_dependents() {
    common::local(async {
        let ctx = common::context();
        let ada = common::owner(&ctx, "ada");
        common::widget(&ctx, "gear", Some(&ada));
        common::widget(&ctx, "cog", Some(&ada));

        let children = ada.reverse("widgets").unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(ada.cached(), vec!["widgets".to_string()]);

        children.delete().await.unwrap();
        assert!(children.is_empty());
        assert!(ada.cached().is_empty());
        assert!(ada.reverse("widgets").unwrap().is_empty());
        assert!(Node::all(&ctx, "Widget").unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn registrations_made_before_start_are_released_after_it() {
    common::local(async {
        let ctx = common::context();
        let ada = common::owner(&ctx, "ada");
        let owner_url = ada.url().to_string();
        let gear = common::widget(&ctx, "gear", Some(&ada));
        let gear_url = gear.url().to_string();
        assert!(ada.has_registrant(&gear_url));

        let endpoint = ctx.start().await.unwrap();
        assert_eq!(ada.url().to_string(), owner_url);
        assert_eq!(ada.url().endpoint, endpoint);

        drop(gear);
        assert_eq!(ada.registrant_count(), 0);
        assert!(registrants::persisted(ctx.db(), &owner_url).unwrap().is_empty());
    })
    .await;
}

#[test]
fn registrations_are_mirrored_into_the_store() {
    let ctx = common::context();
    let ada = common::owner(&ctx, "ada");
    let owner_url = ada.url().to_string();
    let gear = common::widget(&ctx, "gear", Some(&ada));
    let gear_url = gear.url().to_string();

    let rows = registrants::persisted(ctx.db(), &owner_url).unwrap();
    assert_eq!(rows, vec![(gear_url.clone(), "attr:owner".to_string())]);

    drop(gear);
    assert_eq!(ada.registrant_count(), 0);
    assert!(registrants::persisted(ctx.db(), &owner_url).unwrap().is_empty());

    drop(ada);
    assert_eq!(ctx.live_nodes(), 0);
}
