use drogue_bazaar::runtime;
use interface_operator::run;

drogue_bazaar::project!("Interface Operator");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime!(PROJECT).exec(run).await
}
