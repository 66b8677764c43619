use anyhow::Result;
use chatloop::app::{init_tracing, App};
use chatloop::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load()?;
    config.validate()?;

    let mut app = App::new(config)?;
    app.run().await?;

    Ok(())
}
