use log::{error, info};

use sla_probe::agent::run_agent;
use sla_probe::configuration::{Configuration, Parser};
use sla_probe::report::ChannelReporter;

#[tokio::main]
async fn main() {
    env_logger::init();

    let conf = Configuration::parse();
    conf.validate().expect("Configuration is broken!");

    info!("Configuration valid. Starting up...");

    let (reporter, mut samples) = ChannelReporter::new();

    // Reporter boundary: samples leave the event loop through a channel
    // and are printed here, one JSON line each.
    tokio::spawn(async move {
        while let Some(sample) = samples.recv().await {
            match serde_json::to_string(&sample) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("cannot encode sample: {}", e),
            }
        }
    });

    if let Err(e) = run_agent(&conf, &reporter).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
