use anyhow::Context;
use nwc_bridge::{cli::BridgeArgs, run::Bridge};
use secrecy::ExposeSecret;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    logger::init();

    let args = BridgeArgs::from_env()?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    rt.block_on(async move {
        let bridge = Bridge::init(args)?;
        // The URI carries the client secret; stdout only, never the logs.
        println!("{}", bridge.connection_string().expose_secret());
        let spawn_ctrlc_handler = true;
        bridge.run(spawn_ctrlc_handler).await
    })
}
