mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use runy_stage::ActivationState;
use runy_stage::ActorIdentity;
use runy_stage::ClusterBinding;
use runy_stage::InvocationError;
use runy_stage::PoolPolicy;
use runy_stage::Stage;
use runy_stage::StageError;
use runy_stage::StageState;
use runy_stage::TickHook;

#[tokio::test]
async fn starting_twice_is_rejected() {
	let stage = standalone("lifecycle-twice").await;
	assert_eq!(stage.state(), StageState::Running);

	match stage.start().await {
		Err(StageError::InvalidState { expected, actual }) => {
			assert_eq!(expected, StageState::Created);
			assert_eq!(actual, StageState::Running);
		}
		other => panic!("expected invalid state, got {other:?}"),
	}

	stage.stop().await.unwrap();
	assert!(matches!(stage.stop().await, Err(StageError::InvalidState { .. })));
}

#[tokio::test]
async fn invocations_before_start_are_refused() {
	let config = config("lifecycle-early", "test").build().unwrap();
	let stage = Stage::builder(config).register::<CounterActor>().build().unwrap();

	assert_eq!(stage.state(), StageState::Created);
	assert_eq!(counter(&stage, "early").get().await, Err(InvocationError::StageStopped));
}

#[tokio::test]
async fn stop_deactivates_everything() {
	let stage = standalone("lifecycle-stop").await;
	for key in ["stop-1", "stop-2", "stop-3"] {
		assert_eq!(counter(&stage, key).increment(1).await, Ok(1));
	}
	assert_eq!(stage.directory().len(), 3);
	assert_eq!(stage.stats().live(), 3);

	stage.stop().await.unwrap();

	assert_eq!(stage.state(), StageState::Stopped);
	assert!(stage.directory().is_empty());
	assert_eq!(stage.stats().live(), 0);
	for key in ["stop-1", "stop-2", "stop-3"] {
		assert_eq!(deactivations(key), 1, "{key}");
	}

	let proxy = counter(&stage, "stop-1");
	assert_eq!(proxy.get().await, Err(InvocationError::StageStopped));
	assert_eq!(activations("stop-1"), 1);
}

#[tokio::test]
async fn stop_waits_for_admitted_turns() {
	let stage = standalone("lifecycle-drain").await;
	let proxy = counter(&stage, "drain");
	assert_eq!(proxy.increment(1).await, Ok(1));

	let slow = proxy.record(1, 100);
	tokio::time::sleep(Duration::from_millis(20)).await;
	stage.stop().await.unwrap();

	assert_eq!(slow.await, Ok(vec![1]));
	assert_eq!(deactivations("drain"), 1);
}

#[tokio::test]
async fn stop_timeout_forces_remaining_turns() {
	let config = config("lifecycle-forced", "test")
		.stop_timeout(Duration::from_millis(100))
		.build()
		.unwrap();
	let stage = start_stage(config, ClusterBinding::standalone()).await;
	let proxy = counter(&stage, "forced");
	assert_eq!(proxy.increment(1).await, Ok(1));

	let running = proxy.record(1, 5_000);
	let queued = proxy.record(2, 0);
	tokio::time::sleep(Duration::from_millis(20)).await;

	tokio::time::timeout(Duration::from_secs(2), stage.stop())
		.await
		.expect("forced stop is bounded by the stop timeout")
		.unwrap();

	assert_eq!(running.await, Err(InvocationError::StageStopped));
	assert_eq!(queued.await, Err(InvocationError::StageStopped));
	assert_eq!(deactivations("forced"), 0, "hook skipped on forced stop");
	assert!(stage.directory().is_empty());
}

struct CountingHook {
	ticks: Arc<AtomicUsize>,
	fail: bool,
}

impl TickHook for CountingHook {
	fn name(&self) -> &str {
		if self.fail { "failing" } else { "counting" }
	}

	fn tick(&self) -> BoxFuture<'_, anyhow::Result<()>> {
		self.ticks.fetch_add(1, Ordering::Relaxed);
		let fail = self.fail;
		async move {
			anyhow::ensure!(!fail, "hook refused");
			Ok(())
		}
		.boxed()
	}
}

#[tokio::test]
async fn failing_tick_hook_does_not_stop_the_loop() {
	let failing = Arc::new(AtomicUsize::new(0));
	let counting = Arc::new(AtomicUsize::new(0));
	let config = config("lifecycle-ticks", "test")
		.tick_rate(Duration::from_millis(20))
		.build()
		.unwrap();

	let stage = Stage::builder(config)
		.register::<CounterActor>()
		.tick_hook(Arc::new(CountingHook {
			ticks: failing.clone(),
			fail: true,
		}))
		.tick_hook(Arc::new(CountingHook {
			ticks: counting.clone(),
			fail: false,
		}))
		.build()
		.unwrap();
	stage.start().await.unwrap();

	tokio::time::sleep(Duration::from_millis(200)).await;
	stage.stop().await.unwrap();

	assert!(failing.load(Ordering::Relaxed) >= 3);
	assert!(counting.load(Ordering::Relaxed) >= 3);

	let after_stop = counting.load(Ordering::Relaxed);
	tokio::time::sleep(Duration::from_millis(60)).await;
	assert_eq!(counting.load(Ordering::Relaxed), after_stop);
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
	let config = config("lifecycle-dup", "test").build().unwrap();
	let result = Stage::builder(config)
		.register::<CounterActor>()
		.register::<GreeterActor>()
		.register::<CounterActor>()
		.build();

	match result {
		Err(StageError::DuplicateActorType(actor_type)) => assert_eq!(actor_type.as_str(), "Counter"),
		other => panic!("expected duplicate registration, got {other:?}"),
	}
}

#[tokio::test]
async fn shared_pools_run_on_the_callers_runtime() {
	let config = config("lifecycle-shared", "test")
		.cpu_pool(PoolPolicy::Shared)
		.io_pool(PoolPolicy::Shared)
		.build()
		.unwrap();
	let stage = start_stage(config, ClusterBinding::standalone()).await;

	assert_eq!(counter(&stage, "shared").increment(2).await, Ok(2));
	assert_eq!(counter(&stage, "shared").get().await, Ok(2));
	stage.stop().await.unwrap();
	assert_eq!(deactivations("shared"), 1);
}

#[tokio::test]
async fn explicit_deactivation_then_reactivation() {
	let stage = standalone("lifecycle-deactivate").await;
	let identity = ActorIdentity::new("Counter", "explicit");
	assert_eq!(counter(&stage, "explicit").increment(5).await, Ok(5));

	assert!(stage.directory().deactivate(&identity).await);
	assert!(!stage.directory().deactivate(&identity).await);
	assert_eq!(deactivations("explicit"), 1);

	assert_eq!(counter(&stage, "explicit").get().await, Ok(0));
	assert_eq!(activations("explicit"), 2);

	let counts = stage.stats().counts("Counter");
	assert_eq!(counts.total, 2);
	assert_eq!(counts.deactivations, 1);
	assert_eq!(counts.live, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn call_during_deactivation_reaches_a_fresh_activation() {
	let stage = standalone("lifecycle-reactivate").await;
	let identity = ActorIdentity::new("Counter", "reactivate");
	let proxy = counter(&stage, "reactivate");

	let slow = proxy.record(1, 200);
	tokio::time::sleep(Duration::from_millis(50)).await;

	let deactivation = {
		let stage = stage.clone();
		let identity = identity.clone();
		tokio::spawn(async move { stage.directory().deactivate(&identity).await })
	};
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert_eq!(stage.directory().state(&identity), ActivationState::Deactivating);

	let late = proxy.increment(1);

	assert_eq!(slow.await, Ok(vec![1]));
	assert_eq!(late.await, Ok(1));
	assert!(deactivation.await.unwrap());
	assert_eq!(activations("reactivate"), 2);
	assert_eq!(deactivations("reactivate"), 1);
	assert_eq!(stage.directory().state(&identity), ActivationState::Active);
}
