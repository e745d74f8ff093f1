// Line relay: stdin lines go out through the Sender, received messages go to stdout.

use anyhow::{Context, Result};
use pushpull_gateway::transport::BrokerChannel;
use pushpull_gateway::{AmqpBroker, Exchanger, GatewaySettings, Receiver, Sender};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = GatewaySettings::from_env().context("Failed to load gateway settings")?;
    info!(
        channel = %settings.channel,
        role = %settings.role,
        client_id = %settings.client_id,
        "Starting gateway"
    );

    let exchanger = Exchanger::new(
        AmqpBroker::new(),
        settings.connection,
        &settings.channel,
        settings.role,
        &settings.client_id,
    )?;

    exchanger.scope(|sender, receiver| relay(sender, receiver)).await
}

async fn relay<C: BrokerChannel>(sender: Sender<C>, mut receiver: Receiver<C>) -> Result<()> {
    receiver.attach().await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => sender.send(line).await?,
                None => break,
            },
            message = receiver.next() => match message? {
                Some(message) => println!("{}", message),
                None => {
                    info!("Receive sequence ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if receiver.dropped() > 0 {
        info!(dropped = receiver.dropped(), "Messages lost to a full receive buffer");
    }
    Ok(())
}
