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

    // Paper trading against the in-process simulated market. Live providers
    // plug in behind the same seams.
    let sim = Arc::new(SimMarket::new(&cfg));
    json_log(
        "main",
        obj(&[
            ("provider", v_str("sim")),
            ("symbols", v_num(cfg.sim_symbols as f64)),
            ("seed", v_num(cfg.sim_seed as f64)),
        ]),
    );

    let market = sim.clone();
    let mut session = SessionLoop::new(cfg.clone(), sim.clone(), sim.clone(), sim.clone()).await?;

    // The sim market evolves on its own cadence; the session only observes it.
    let ticker = tokio::spawn(async move {
        let interval = std::time::Duration::from_secs_f64(cfg.expected_tick_secs.max(0.1));
        loop {
            tokio::time::sleep(interval).await;
            market.step();
        }
    });

    let result = session.run().await;
    ticker.abort();
    json_log(
        "main",
        obj(&[
            ("event", v_str("exit")),
            ("total_realized_profit", v_num(session.execution().total_realized_profit())),
        ]),
    );
    result
}
