//! Liquidate mode: ignore all buy logic, close every nonzero position, and
//! exit with total proceeds. Run exactly one instance against an account.

use std::sync::Arc;

use anyhow::Result;

use cycletrader::config::Config;
use cycletrader::logging::{json_log, obj, v_num, v_str};
use cycletrader::session::SessionLoop;
use cycletrader::sim::SimMarket;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate()?;

    let sim = Arc::new(SimMarket::new(&cfg));
    let mut session = SessionLoop::new(cfg, sim.clone(), sim.clone(), sim.clone()).await?;
    let proceeds = session.liquidate().await?;
    json_log(
        "main",
        obj(&[
            ("event", v_str("liquidate_exit")),
            ("proceeds", v_num(proceeds)),
        ]),
    );
    Ok(())
}
