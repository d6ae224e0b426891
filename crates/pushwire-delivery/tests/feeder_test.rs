//! Feeder admission and loop control.

use std::{sync::Arc, time::Duration};

use pushwire_core::{CoreError, Protocol};
use pushwire_delivery::{Dispatcher, Feeder, FeederConfig};
use pushwire_testing::{eventually, RecordingDispatcher, TestEnv};

fn config(batch_size: usize) -> FeederConfig {
    FeederConfig { batch_size, ..FeederConfig::default() }
}

fn feeder(env: &TestEnv, dispatcher: &Arc<RecordingDispatcher>, config: FeederConfig) -> Arc<Feeder> {
    let dispatcher: Arc<dyn Dispatcher> = dispatcher.clone();
    Arc::new(Feeder::new(env.store_handle(), dispatcher, config))
}

#[tokio::test]
async fn fetches_only_the_room_left_under_batch_size() {
    let env = TestEnv::new();
    let app = env.create_app("relay", Protocol::Webhook, 1).await;
    let created = env.create_notifications(&app, 8).await.unwrap();

    let dispatcher = Arc::new(RecordingDispatcher::with_queue_size(6));
    let feeder = feeder(&env, &dispatcher, config(10));

    let count = feeder.enqueue_notifications().await.unwrap();

    assert_eq!(count, 4);
    assert_eq!(env.store.fetch_limits().await, vec![Some(4)]);

    let expected: Vec<_> = created.iter().take(4).map(|n| n.id).collect();
    assert_eq!(dispatcher.batches(), vec![expected], "one handoff in store order");
}

#[tokio::test]
async fn full_runners_skip_the_store() {
    let env = TestEnv::new();
    let app = env.create_app("relay", Protocol::Webhook, 1).await;
    env.create_notifications(&app, 3).await.unwrap();

    let dispatcher = Arc::new(RecordingDispatcher::with_queue_size(10));
    let feeder = feeder(&env, &dispatcher, config(10));

    assert_eq!(feeder.enqueue_notifications().await.unwrap(), 0);
    assert!(env.store.fetch_limits().await.is_empty());
    assert!(dispatcher.batches().is_empty());

    dispatcher.set_queue_size(12);
    assert_eq!(feeder.enqueue_notifications().await.unwrap(), 0, "overfull runners never underflow");
    assert!(env.store.fetch_limits().await.is_empty());
}

#[tokio::test]
async fn empty_fetch_dispatches_nothing() {
    let env = TestEnv::new();
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let feeder = feeder(&env, &dispatcher, config(10));

    assert_eq!(feeder.enqueue_notifications().await.unwrap(), 0);
    assert_eq!(env.store.fetch_limits().await, vec![Some(10)]);
    assert!(dispatcher.batches().is_empty());
}

#[tokio::test]
async fn push_mode_fetches_without_limit_once() {
    let env = TestEnv::new();
    let app = env.create_app("relay", Protocol::Webhook, 1).await;
    env.create_notifications(&app, 15).await.unwrap();

    let dispatcher = Arc::new(RecordingDispatcher::default());
    let feeder = feeder(&env, &dispatcher, FeederConfig { push: true, ..config(10) });

    feeder.start().await;

    assert_eq!(env.store.fetch_limits().await, vec![None]);
    assert_eq!(dispatcher.batches().len(), 1);
    assert_eq!(dispatcher.batches()[0].len(), 15);
}

#[tokio::test]
async fn fetch_errors_propagate_from_a_single_cycle() {
    let env = TestEnv::new();
    env.store.inject_fetch_error(CoreError::Connection("database went away".into())).await;

    let dispatcher = Arc::new(RecordingDispatcher::default());
    let feeder = feeder(&env, &dispatcher, config(10));

    assert!(feeder.enqueue_notifications().await.is_err());
    assert!(dispatcher.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn loop_survives_a_failed_cycle() {
    let env = TestEnv::new();
    let app = env.create_app("relay", Protocol::Webhook, 1).await;
    env.create_notifications(&app, 2).await.unwrap();
    env.store.inject_fetch_error(CoreError::Connection("database went away".into())).await;

    let dispatcher = Arc::new(RecordingDispatcher::default());
    let feeder = feeder(
        &env,
        &dispatcher,
        FeederConfig { embedded: true, push_poll: Duration::from_secs(2), ..config(10) },
    );

    feeder.start().await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(env.store.fetch_limits().await.len(), 2, "second cycle after push_poll");
    assert_eq!(dispatcher.batches().len(), 1);

    feeder.stop().await;
}

#[tokio::test]
async fn wakeup_starts_the_next_cycle_early() {
    let env = TestEnv::new();
    let app = env.create_app("relay", Protocol::Webhook, 1).await;

    let dispatcher = Arc::new(RecordingDispatcher::default());
    let feeder = feeder(
        &env,
        &dispatcher,
        FeederConfig { embedded: true, push_poll: Duration::from_secs(3600), ..config(10) },
    );

    let store = &env.store;
    feeder.start().await;
    eventually("first cycle", Duration::from_secs(2), || async move {
        store.fetch_limits().await.len() == 1
    })
    .await
    .unwrap();

    let created = env.create_notification(&app).await.unwrap().id;
    feeder.wakeup();

    let recorded = &dispatcher;
    eventually("woken cycle", Duration::from_secs(2), || async move {
        recorded.batches().concat().contains(&created)
    })
    .await
    .unwrap();

    feeder.stop().await;
}

#[tokio::test]
async fn stop_releases_the_connection_and_ends_inline_loop() {
    let env = TestEnv::new();
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let feeder = feeder(
        &env,
        &dispatcher,
        FeederConfig { push_poll: Duration::from_secs(3600), ..config(10) },
    );

    let running = {
        let feeder = feeder.clone();
        tokio::spawn(async move { feeder.start().await })
    };

    let store = &env.store;
    eventually("first cycle", Duration::from_secs(2), || async move {
        !store.fetch_limits().await.is_empty()
    })
    .await
    .unwrap();

    feeder.stop().await;
    tokio::time::timeout(Duration::from_secs(2), running).await.unwrap().unwrap();

    assert_eq!(env.store.released_connections().await, 1);
    assert_eq!(env.store.fetch_limits().await.len(), 1, "no cycle after stop");
}
