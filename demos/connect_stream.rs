use std::error::Error;

use lishi_sdk::client::{ClientOptions, LishiClient};
use lishi_sdk::stream::codec::Marker;
use lishi_sdk::stream::push::{ActionTracesRequest, StreamOptions};
use lishi_sdk::stream::transport::LifecycleEvent;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lishi_sdk=debug")),
        )
        .init();

    let api_key = "REPLACE_WITH_API_KEY".to_string();
    let network = "REPLACE_WITH_NETWORK_HOST".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = LishiClient::new(ClientOptions::for_network(&network).with_api_key(api_key))?;

        let mut lifecycle = client.push_lifecycle();
        tokio::spawn(async move {
            while let Ok(event) = lifecycle.recv().await {
                match event {
                    LifecycleEvent::Opened { epoch, reconnected } => {
                        println!("connected epoch={epoch} reconnected={reconnected}");
                    }
                    LifecycleEvent::Closed { reason } => println!("closed: {}", reason.describe()),
                }
            }
        });

        let stream = client
            .stream_action_traces(
                ActionTracesRequest::for_accounts(["eosio.token"]).with_action_names(["transfer"]),
                |stream, message| {
                    if let Some(err) = message.error() {
                        eprintln!("stream {} failed: {err}", stream.id());
                        return;
                    }
                    if let Some(block) = message.data.get("block_num").and_then(|v| v.as_u64()) {
                        // Resume from here after a reconnect.
                        let _ = stream.mark(Marker::BlockNum(block));
                    }
                    println!("{} {}", message.kind, message.data);
                },
                StreamOptions::default().with_progress(10),
            )
            .await?;

        tokio::select! {
            outcome = stream.join() => outcome?,
            _ = tokio::signal::ctrl_c() => stream.close().await,
        }

        client.release();
        Ok::<(), Box<dyn Error>>(())
    })
}
