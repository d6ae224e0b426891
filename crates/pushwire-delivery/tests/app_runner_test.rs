//! App runner delivery outcomes, queue accounting and lifecycle.

use std::{sync::Arc, time::Duration};

use pushwire_core::{App, Protocol};
use pushwire_delivery::{AppRunners, Delivery, DeliveryError, RunnerConfig};
use pushwire_testing::{eventually, ScriptedGateway, StaticGatewayFactory, TestEnv};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    env: TestEnv,
    gateway: Arc<ScriptedGateway>,
    runners: AppRunners,
}

impl Harness {
    fn new(gateway: ScriptedGateway) -> Self {
        Self::with_config(gateway, RunnerConfig::default())
    }

    fn with_config(gateway: ScriptedGateway, config: RunnerConfig) -> Self {
        let env = TestEnv::new();
        let gateway = Arc::new(gateway);
        let factory = StaticGatewayFactory::new(gateway.clone()).rejecting(Protocol::Apns);
        let delivery = Delivery::new(env.store_handle(), env.clock_handle());
        let runners = AppRunners::new(Arc::new(factory), delivery, config);
        Self { env, gateway, runners }
    }

    async fn running_app(&self, connections: i32) -> App {
        let app = self.env.create_app("relay", Protocol::Webhook, connections).await;
        self.runners.start(app.clone()).await.unwrap();
        app
    }

    async fn wait_idle(&self) {
        let runners = &self.runners;
        eventually("runners idle", WAIT, || async move {
            runners.cumulative_queue_size().await == 0
        })
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn accepted_batches_are_delivered() {
    let h = Harness::new(ScriptedGateway::new());
    let app = h.running_app(1).await;
    let created = h.env.create_notifications(&app, 3).await.unwrap();

    h.runners.enqueue(created.clone()).await;
    h.wait_idle().await;

    for n in &created {
        let stored = h.env.reload(n.id).await.unwrap();
        assert!(stored.delivered);
        assert_eq!(stored.delivered_at, Some(h.env.now()));
    }
    assert_eq!(h.gateway.sent_count(), 3);

    h.runners.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn connection_errors_back_off_exponentially() {
    let h = Harness::new(ScriptedGateway::new());
    h.gateway.fail_times(&DeliveryError::connection("reset by peer"), 1);
    let app = h.running_app(1).await;
    let n = h.env.create_notification(&app).await.unwrap();

    h.runners.enqueue(vec![n.clone()]).await;
    h.wait_idle().await;

    let stored = h.env.reload(n.id).await.unwrap();
    assert!(!stored.delivered && !stored.failed);
    assert_eq!(stored.retries, 1);
    assert_eq!(stored.deliver_after, Some(h.env.now() + chrono::Duration::seconds(2)));

    h.runners.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn rate_limits_use_the_gateway_delay() {
    let h = Harness::new(ScriptedGateway::new());
    h.gateway.push_outcome(Err(DeliveryError::rate_limited(30)));
    let app = h.running_app(1).await;
    let n = h.env.create_notification(&app).await.unwrap();

    h.runners.enqueue(vec![n.clone()]).await;
    h.wait_idle().await;

    let stored = h.env.reload(n.id).await.unwrap();
    assert_eq!(stored.retries, 1);
    assert_eq!(stored.deliver_after, Some(h.env.now() + chrono::Duration::seconds(30)));

    h.runners.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn protocol_errors_fail_with_code() {
    let h = Harness::new(ScriptedGateway::new());
    h.gateway.push_outcome(Err(DeliveryError::protocol(8, "Invalid token")));
    let app = h.running_app(1).await;
    let n = h.env.create_notification(&app).await.unwrap();

    h.runners.enqueue(vec![n.clone()]).await;
    h.wait_idle().await;

    let stored = h.env.reload(n.id).await.unwrap();
    assert!(stored.failed);
    assert!(!stored.delivered);
    assert_eq!(stored.error_code, Some(8));
    assert_eq!(stored.error_description.as_deref(), Some("Invalid token"));
    assert_eq!(stored.retries, 0);

    h.runners.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn in_flight_notifications_are_not_queued_twice() {
    let h = Harness::new(ScriptedGateway::gated());
    let app = h.running_app(1).await;
    let n = h.env.create_notification(&app).await.unwrap();

    h.runners.enqueue(vec![n.clone()]).await;
    let gateway = &h.gateway;
    eventually("first send", WAIT, || async move { gateway.sent_count() == 1 }).await.unwrap();

    h.runners.enqueue(vec![n.clone()]).await;
    assert_eq!(h.runners.cumulative_queue_size().await, 1);

    h.gateway.release(1);
    h.wait_idle().await;

    assert_eq!(h.gateway.batches(), vec![vec![n.id]]);
    assert!(h.env.reload(n.id).await.unwrap().delivered);

    h.runners.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn stale_copy_is_resent_but_keeps_first_outcome() {
    let h = Harness::new(ScriptedGateway::new());
    let app = h.running_app(1).await;
    let stale = h.env.create_notification(&app).await.unwrap();

    h.runners.enqueue(vec![stale.clone()]).await;
    h.wait_idle().await;
    let first = h.env.reload(stale.id).await.unwrap();
    assert!(first.delivered);

    h.env.advance_time(Duration::from_secs(10));
    h.gateway.push_outcome(Err(DeliveryError::protocol(8, "Invalid token")));
    h.runners.enqueue(vec![stale.clone()]).await;
    h.wait_idle().await;

    assert_eq!(h.gateway.batches(), vec![vec![stale.id], vec![stale.id]], "delivery is at-least-once");
    let stored = h.env.reload(stale.id).await.unwrap();
    assert!(stored.delivered && !stored.failed);
    assert_eq!(stored.delivered_at, first.delivered_at);
    assert_eq!(stored.error_code, None);

    h.runners.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn queue_size_counts_until_outcome_is_recorded() {
    let h = Harness::new(ScriptedGateway::gated());
    let app = h.running_app(1).await;
    let created = h.env.create_notifications(&app, 3).await.unwrap();

    h.runners.enqueue(created).await;
    let gateway = &h.gateway;
    eventually("first send", WAIT, || async move { gateway.sent_count() > 0 }).await.unwrap();

    assert_eq!(h.runners.cumulative_queue_size().await, 3);
    assert_eq!(h.runners.queue_sizes().await.get(&app.id), Some(&3));

    h.gateway.release(10);
    h.wait_idle().await;
    h.runners.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn batches_never_exceed_max_batch() {
    let config = RunnerConfig { max_batch: 2, ..RunnerConfig::default() };
    let h = Harness::with_config(ScriptedGateway::new(), config);
    let app = h.running_app(1).await;
    let created = h.env.create_notifications(&app, 5).await.unwrap();

    h.runners.enqueue(created).await;
    h.wait_idle().await;

    let batches = h.gateway.batches();
    assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 2), "{batches:?}");
    assert_eq!(h.gateway.sent_count(), 5);

    h.runners.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn notifications_for_unknown_apps_stay_pending() {
    let h = Harness::new(ScriptedGateway::new());
    let app = h.env.create_app("idle", Protocol::Webhook, 1).await;
    let n = h.env.create_notification(&app).await.unwrap();

    h.runners.enqueue(vec![n.clone()]).await;

    assert_eq!(h.runners.cumulative_queue_size().await, 0);
    assert!(h.gateway.batches().is_empty());
    let stored = h.env.reload(n.id).await.unwrap();
    assert!(!stored.delivered && !stored.failed);
}

#[tokio::test]
async fn sync_follows_the_store() {
    let h = Harness::new(ScriptedGateway::new());
    let relay = h.env.create_app("relay", Protocol::Webhook, 2).await;
    let other = h.env.create_app("other", Protocol::Gcm, 1).await;
    let ios = h.env.create_app("ios", Protocol::Apns, 1).await;

    h.runners.sync(&h.env.store).await.unwrap();
    let mut running = h.runners.app_ids().await;
    running.sort();
    let mut expected = vec![relay.id, other.id];
    expected.sort();
    assert_eq!(running, expected, "apps without a gateway are skipped");
    assert!(!running.contains(&ios.id));

    h.env.store.remove_app(other.id).await;
    h.runners.sync(&h.env.store).await.unwrap();
    assert_eq!(h.runners.app_ids().await, vec![relay.id]);

    h.runners.shutdown(WAIT).await.unwrap();
    assert!(h.runners.app_ids().await.is_empty());
}

#[tokio::test]
async fn sync_restarts_changed_apps() {
    let h = Harness::new(ScriptedGateway::new());
    let mut app = h.env.create_app("relay", Protocol::Webhook, 1).await;
    h.runners.sync(&h.env.store).await.unwrap();

    app.connections = 3;
    h.env.store.add_app(app.clone()).await;
    h.runners.sync(&h.env.store).await.unwrap();

    assert_eq!(h.runners.app_ids().await, vec![app.id]);

    let n = h.env.create_notification(&app).await.unwrap();
    h.runners.enqueue(vec![n.clone()]).await;
    h.wait_idle().await;
    assert!(h.env.reload(n.id).await.unwrap().delivered);

    h.runners.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn shutdown_times_out_on_stuck_workers() {
    let h = Harness::new(ScriptedGateway::gated());
    let app = h.running_app(1).await;
    let n = h.env.create_notification(&app).await.unwrap();

    h.runners.enqueue(vec![n]).await;
    let gateway = &h.gateway;
    eventually("send started", WAIT, || async move { gateway.sent_count() == 1 }).await.unwrap();

    let result = h.runners.shutdown(Duration::from_millis(100)).await;
    assert!(matches!(result, Err(DeliveryError::ShutdownTimeout { .. })));

    h.gateway.release(1);
}
