use std::time::Duration;

use runy_stage::prelude::*;
use runy_stage::LocalCluster;
use runy_stage::PoolPolicy;
use runy_stage::Stage;
use runy_stage::StageConfig;
use serde::Deserialize;
use serde::Serialize;

pub struct Account;

impl ActorInterface for Account {
	const ACTOR_TYPE: &'static str = "Account";
	type Proxy = AccountProxy;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Deposit {
	pub amount: f64,
}

impl Method for Deposit {
	type Interface = Account;
	type Reply = f64;
	const NAME: &'static str = "deposit";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Withdraw {
	pub amount: f64,
}

impl Method for Withdraw {
	type Interface = Account;
	type Reply = f64;
	const NAME: &'static str = "withdraw";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetBalance;

impl Method for GetBalance {
	type Interface = Account;
	type Reply = f64;
	const NAME: &'static str = "balance";
}

/// Accounts are addressed by number, so a transfer only carries the key.
#[derive(Debug, Serialize, Deserialize)]
pub struct Transfer {
	pub to: String,
	pub amount: f64,
}

impl Method for Transfer {
	type Interface = Account;
	type Reply = ();
	const NAME: &'static str = "transfer";
}

#[derive(Debug, thiserror::Error)]
pub enum BankError {
	#[error("insufficient funds: balance {balance}, requested {requested}")]
	InsufficientFunds { balance: f64, requested: f64 },
	#[error("invalid amount: {amount}")]
	InvalidAmount { amount: f64 },
}

pub struct AccountProxy(ActorRef<Account>);

impl ActorProxy<Account> for AccountProxy {
	fn from_ref(actor: ActorRef<Account>) -> Self {
		AccountProxy(actor)
	}
}

impl AccountProxy {
	pub fn deposit(&self, amount: f64) -> InvocationHandle<f64> {
		self.0.invoke(Deposit { amount })
	}

	pub fn withdraw(&self, amount: f64) -> InvocationHandle<f64> {
		self.0.invoke(Withdraw { amount })
	}

	pub fn balance(&self) -> InvocationHandle<f64> {
		self.0.invoke(GetBalance)
	}

	pub fn transfer(&self, to: &str, amount: f64) -> InvocationHandle<()> {
		self.0.invoke(Transfer {
			to: to.to_string(),
			amount,
		})
	}
}

pub struct BankAccount {
	number: String,
	balance: f64,
}

impl BankAccount {
	fn take(&mut self, amount: f64) -> Result<f64, BankError> {
		if amount <= 0.0 {
			return Err(BankError::InvalidAmount { amount });
		}
		if self.balance < amount {
			return Err(BankError::InsufficientFunds {
				balance: self.balance,
				requested: amount,
			});
		}
		self.balance -= amount;
		Ok(self.balance)
	}
}

impl Actor for BankAccount {
	type Interface = Account;

	fn create(ctx: &ActorContext) -> anyhow::Result<Self> {
		Ok(BankAccount {
			number: ctx.identity().key.clone(),
			balance: 0.0,
		})
	}

	fn methods(methods: &mut Methods<Self>) {
		methods
			.add::<Deposit>()
			.add::<Withdraw>()
			.add::<GetBalance>()
			.add::<Transfer>();
	}

	async fn on_activate(&mut self, ctx: &ActorContext) -> anyhow::Result<()> {
		println!("account {} opened on {}", self.number, ctx.node());
		Ok(())
	}
}

impl Handler<Deposit> for BankAccount {
	async fn handle(&mut self, _call: Call<'_>, msg: Deposit) -> anyhow::Result<f64> {
		if msg.amount <= 0.0 {
			return Err(BankError::InvalidAmount { amount: msg.amount }.into());
		}
		self.balance += msg.amount;
		Ok(self.balance)
	}
}

impl Handler<Withdraw> for BankAccount {
	async fn handle(&mut self, _call: Call<'_>, msg: Withdraw) -> anyhow::Result<f64> {
		Ok(self.take(msg.amount)?)
	}
}

impl Handler<GetBalance> for BankAccount {
	async fn handle(&mut self, _call: Call<'_>, _msg: GetBalance) -> anyhow::Result<f64> {
		Ok(self.balance)
	}
}

impl Handler<Transfer> for BankAccount {
	async fn handle(&mut self, call: Call<'_>, msg: Transfer) -> anyhow::Result<()> {
		self.take(msg.amount)?;
		let target = call.create_proxy::<Account>(msg.to.clone())?;
		if let Err(err) = target.deposit(msg.amount).await {
			// put it back, the target never saw the money
			self.balance += msg.amount;
			return Err(err.into());
		}
		println!("transferred {:.2} from {} to {}", msg.amount, self.number, msg.to);
		Ok(())
	}
}

fn stage(cluster: &LocalCluster, node: &str) -> anyhow::Result<Stage> {
	let config = StageConfig::builder()
		.cluster_name("bank")
		.node_identity(node)
		.cpu_pool(PoolPolicy::Fixed(2))
		.io_pool(PoolPolicy::Fixed(2))
		.actor_ttl(Duration::from_secs(30))
		.build()?;
	Ok(Stage::builder(config)
		.register::<BankAccount>()
		.cluster(cluster.binding())
		.build()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cluster = LocalCluster::new();
	let east = stage(&cluster, "east")?;
	let west = stage(&cluster, "west")?;
	east.start().await?;
	west.start().await?;

	// the same account is reachable from either stage
	let alice = east.actor_proxy_factory().create_proxy::<Account>("ALICE-001")?;
	let bob = west.actor_proxy_factory().create_proxy::<Account>("BOB-002")?;

	alice.deposit(1000.0).await?;
	bob.deposit(500.0).await?;
	alice.transfer("BOB-002", 300.0).await?;

	let bob_from_east = east.actor_proxy_factory().create_proxy::<Account>("BOB-002")?;
	println!(
		"alice: {:.2}, bob: {:.2}",
		alice.balance().await?,
		bob_from_east.balance().await?
	);

	match alice.withdraw(2000.0).await {
		Ok(_) => println!("withdrawal succeeded unexpectedly"),
		Err(err) => println!("withdrawal refused: {err}"),
	}

	println!("east: {}", east.stats().report());
	println!("west: {}", west.stats().report());

	east.stop().await?;
	west.stop().await?;
	Ok(())
}
