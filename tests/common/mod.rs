#![allow(dead_code)]

use std::sync::LazyLock;
use std::time::Duration;

use dashmap::DashMap;
use runy_stage::prelude::*;
use runy_stage::ClusterBinding;
use runy_stage::PlacementStrategy;
use runy_stage::PoolPolicy;
use runy_stage::Stage;
use runy_stage::StageConfig;
use runy_stage::StageConfigBuilder;
use serde::Deserialize;
use serde::Serialize;

static ACTIVATIONS: LazyLock<DashMap<String, usize>> = LazyLock::new(DashMap::new);
static DEACTIVATIONS: LazyLock<DashMap<String, usize>> = LazyLock::new(DashMap::new);

/// Activation hook runs for `key`, failed ones included.
pub fn activations(key: &str) -> usize {
	ACTIVATIONS.get(key).map(|count| *count).unwrap_or(0)
}

pub fn deactivations(key: &str) -> usize {
	DEACTIVATIONS.get(key).map(|count| *count).unwrap_or(0)
}

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

pub struct Counter;

impl ActorInterface for Counter {
	const ACTOR_TYPE: &'static str = "Counter";
	type Proxy = CounterProxy;
}

#[derive(Serialize, Deserialize)]
pub struct Increment {
	pub by: i64,
}

impl Method for Increment {
	type Interface = Counter;
	type Reply = i64;
	const NAME: &'static str = "increment";
}

#[derive(Serialize, Deserialize)]
pub struct Get;

impl Method for Get {
	type Interface = Counter;
	type Reply = i64;
	const NAME: &'static str = "get";
}

/// Sleeps inside the turn, then appends `tag` to the history.
#[derive(Serialize, Deserialize)]
pub struct Record {
	pub tag: u32,
	pub millis: u64,
}

impl Method for Record {
	type Interface = Counter;
	type Reply = Vec<u32>;
	const NAME: &'static str = "record";
}

#[derive(Serialize, Deserialize)]
pub struct Fail;

impl Method for Fail {
	type Interface = Counter;
	type Reply = ();
	const NAME: &'static str = "fail";
}

#[derive(Serialize, Deserialize)]
pub struct Explode;

impl Method for Explode {
	type Interface = Counter;
	type Reply = ();
	const NAME: &'static str = "explode";
}

#[derive(Serialize, Deserialize)]
pub struct Host;

impl Method for Host {
	type Interface = Counter;
	type Reply = String;
	const NAME: &'static str = "host";
}

#[derive(Serialize, Deserialize)]
pub struct Describe {
	pub items: Vec<String>,
}

impl Method for Describe {
	type Interface = Counter;
	type Reply = String;
	const NAME: &'static str = "describe";
}

/// What `Describe` answers, computed without any actor.
pub fn describe(items: &[String]) -> String {
	let mut sorted = items.to_vec();
	sorted.sort();
	sorted.dedup();
	format!("{} items: {}", sorted.len(), sorted.join(", "))
}

pub struct CounterProxy(ActorRef<Counter>);

impl ActorProxy<Counter> for CounterProxy {
	fn from_ref(actor: ActorRef<Counter>) -> Self {
		CounterProxy(actor)
	}
}

impl CounterProxy {
	pub fn actor(&self) -> &ActorRef<Counter> {
		&self.0
	}

	pub fn increment(&self, by: i64) -> InvocationHandle<i64> {
		self.0.invoke(Increment { by })
	}

	pub fn get(&self) -> InvocationHandle<i64> {
		self.0.invoke(Get)
	}

	pub fn record(&self, tag: u32, millis: u64) -> InvocationHandle<Vec<u32>> {
		self.0.invoke(Record { tag, millis })
	}

	pub fn fail(&self) -> InvocationHandle<()> {
		self.0.invoke(Fail)
	}

	pub fn explode(&self) -> InvocationHandle<()> {
		self.0.invoke(Explode)
	}

	pub fn host(&self) -> InvocationHandle<String> {
		self.0.invoke(Host)
	}

	pub fn describe(&self, items: Vec<String>) -> InvocationHandle<String> {
		self.0.invoke(Describe { items })
	}
}

/// Keys starting with `broken` never activate, keys starting with `panicky`
/// panic while activating, and keys starting with `flaky` fail their first
/// activation only.
pub struct CounterActor {
	key: String,
	value: i64,
	history: Vec<u32>,
	busy: bool,
}

impl Actor for CounterActor {
	type Interface = Counter;

	fn create(ctx: &ActorContext) -> anyhow::Result<Self> {
		Ok(CounterActor {
			key: ctx.identity().key.clone(),
			value: 0,
			history: Vec::new(),
			busy: false,
		})
	}

	fn methods(methods: &mut Methods<Self>) {
		methods
			.add::<Increment>()
			.add::<Get>()
			.add::<Record>()
			.add::<Fail>()
			.add::<Explode>()
			.add::<Host>()
			.add::<Describe>();
	}

	async fn on_activate(&mut self, _ctx: &ActorContext) -> anyhow::Result<()> {
		let attempt = {
			let mut count = ACTIVATIONS.entry(self.key.clone()).or_insert(0);
			*count += 1;
			*count
		};

		if self.key.starts_with("broken") {
			tokio::time::sleep(Duration::from_millis(100)).await;
			anyhow::bail!("IllegalStateException: {} cannot start", self.key);
		}
		if self.key.starts_with("panicky") {
			panic!("counter activation exploded");
		}
		if self.key.starts_with("flaky") && attempt == 1 {
			anyhow::bail!("IllegalStateException: first start of {}", self.key);
		}
		Ok(())
	}

	async fn on_deactivate(&mut self, _ctx: &ActorContext) {
		*DEACTIVATIONS.entry(self.key.clone()).or_insert(0) += 1;
	}
}

impl Handler<Increment> for CounterActor {
	async fn handle(&mut self, _call: Call<'_>, message: Increment) -> anyhow::Result<i64> {
		self.value += message.by;
		Ok(self.value)
	}
}

impl Handler<Get> for CounterActor {
	async fn handle(&mut self, _call: Call<'_>, _message: Get) -> anyhow::Result<i64> {
		Ok(self.value)
	}
}

impl Handler<Record> for CounterActor {
	async fn handle(&mut self, _call: Call<'_>, message: Record) -> anyhow::Result<Vec<u32>> {
		anyhow::ensure!(!self.busy, "turns overlapped");
		self.busy = true;
		tokio::time::sleep(Duration::from_millis(message.millis)).await;
		self.history.push(message.tag);
		self.busy = false;
		Ok(self.history.clone())
	}
}

impl Handler<Fail> for CounterActor {
	async fn handle(&mut self, _call: Call<'_>, _message: Fail) -> anyhow::Result<()> {
		anyhow::bail!("counter refused")
	}
}

impl Handler<Explode> for CounterActor {
	async fn handle(&mut self, _call: Call<'_>, _message: Explode) -> anyhow::Result<()> {
		panic!("counter exploded")
	}
}

impl Handler<Host> for CounterActor {
	async fn handle(&mut self, call: Call<'_>, _message: Host) -> anyhow::Result<String> {
		Ok(call.node().to_string())
	}
}

impl Handler<Describe> for CounterActor {
	async fn handle(&mut self, _call: Call<'_>, message: Describe) -> anyhow::Result<String> {
		Ok(describe(&message.items))
	}
}

pub struct Greeter;

impl ActorInterface for Greeter {
	const ACTOR_TYPE: &'static str = "Greeter";
	type Proxy = ActorRef<Self>;
}

#[derive(Serialize, Deserialize)]
pub struct Greet {
	pub name: String,
}

impl Method for Greet {
	type Interface = Greeter;
	type Reply = String;
	const NAME: &'static str = "greet";
}

/// Counts its greetings in a `Counter` keyed `greetings-<key>`.
pub struct GreeterActor {
	greetings: CounterProxy,
}

impl Actor for GreeterActor {
	type Interface = Greeter;

	fn create(ctx: &ActorContext) -> anyhow::Result<Self> {
		let greetings = ctx.create_proxy::<Counter>(format!("greetings-{}", ctx.identity().key))?;
		Ok(GreeterActor { greetings })
	}

	fn methods(methods: &mut Methods<Self>) {
		methods.add::<Greet>();
	}
}

impl Handler<Greet> for GreeterActor {
	async fn handle(&mut self, _call: Call<'_>, message: Greet) -> anyhow::Result<String> {
		let count = self.greetings.increment(1).await?;
		Ok(format!("Hello, {}! (#{count})", message.name))
	}
}

/// Declared by callers but hosted nowhere.
pub struct Unhosted;

impl ActorInterface for Unhosted {
	const ACTOR_TYPE: &'static str = "Unhosted";
	type Proxy = ActorRef<Self>;
}

pub fn config(node: &str, cluster: &str) -> StageConfigBuilder {
	StageConfig::builder()
		.node_identity(node)
		.cluster_name(cluster)
		.cpu_pool(PoolPolicy::Fixed(2))
		.io_pool(PoolPolicy::Fixed(2))
		.placement(PlacementStrategy::PreferLocal)
}

pub async fn start_stage(config: StageConfig, cluster: ClusterBinding) -> Stage {
	init_tracing();
	let stage = Stage::builder(config)
		.register::<CounterActor>()
		.register::<GreeterActor>()
		.cluster(cluster)
		.build()
		.unwrap();
	stage.start().await.unwrap();
	stage
}

pub async fn standalone(node: &str) -> Stage {
	start_stage(config(node, "test").build().unwrap(), ClusterBinding::standalone()).await
}

pub fn counter(stage: &Stage, key: &str) -> CounterProxy {
	stage.actor_proxy_factory().create_proxy::<Counter>(key).unwrap()
}
