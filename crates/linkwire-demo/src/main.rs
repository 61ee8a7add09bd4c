//! linkwire-demo: echo server and client for trying out descriptors

use anyhow::Context;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use linkwire::{create_with_config, ClientConfig, ClientEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage:");
        eprintln!("  linkwire-demo echo <bind_addr>");
        eprintln!("  linkwire-demo send <descriptor> <message>...");
        eprintln!();
        eprintln!("Example descriptor: \"protocol=tcp; server=127.0.0.1:8888; payloadAware=true\"");
        std::process::exit(2);
    }
    match args[1].as_str() {
        "echo" => {
            let bind: SocketAddr = args.get(2).context("missing bind_addr")?.parse()?;
            run_echo(bind).await
        }
        "send" => {
            let descriptor = args.get(2).context("missing descriptor")?;
            run_send(descriptor, &args[3..]).await
        }
        _ => {
            anyhow::bail!("unknown mode");
        }
    }
}

/// Echo every byte back; framing passes through untouched.
async fn run_echo(bind: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "echo server listening");

    loop {
        let (mut stream, peer) = listener.accept().await?;
        info!(%peer, "accepted");
        tokio::spawn(async move {
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = stream.write_all(&buf[..n]).await {
                            warn!(%peer, error = %e, "echo write failed");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%peer, error = %e, "echo read failed");
                        break;
                    }
                }
            }
            info!(%peer, "closed");
        });
    }
}

async fn run_send(descriptor: &str, messages: &[String]) -> anyhow::Result<()> {
    let config = ClientConfig::load()?;
    let client = create_with_config(descriptor, config)?;
    let mut events = client.events().context("event stream already taken")?;

    let mut handle = client.connect();
    handle.wait().await.map_err(|e| anyhow::anyhow!("connect failed: {}", e))?;
    println!("CONNECTED {}", client.server_uri());

    for message in messages {
        client
            .send(message.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("send failed: {}", e))?;
    }

    // Print replies until the link has been quiet for a while.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(5)) => break,
            event = events.recv() => match event {
                Some(ClientEvent::PayloadReceived(payload)) => {
                    match std::str::from_utf8(&payload) {
                        Ok(text) => println!("RECV {}", text),
                        Err(_) => println!("RECV_HEX {}", hex::encode(&payload)),
                    }
                }
                Some(ClientEvent::ReceiveError(err)) => warn!(error = %err, "receive error"),
                Some(ClientEvent::ConnectionTerminated) | None => break,
                Some(_) => {}
            },
        }
    }

    client.disconnect().await;
    print!("{}", client.status());
    Ok(())
}
