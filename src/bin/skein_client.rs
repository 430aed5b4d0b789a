use std::{error::Error, net::SocketAddr, sync::mpsc, time::Instant};

use clap::Parser;
use log::{info, warn};
use skein::{
    Client, ReturnType, ReturnValue,
    cli::TransportArgs,
    demo::{ADD, COUNT, ECHO, NOTIFY, PING},
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(default_value = "127.0.0.1:13304")]
    address: SocketAddr,

    /// Number of calls issued per calling convention
    #[arg(short, long, default_value_t = 1000)]
    calls: u64,

    /// Size in bytes of the echoed payload
    #[arg(short, long, default_value_t = 64)]
    payload_size: usize,

    #[command(flatten)]
    transport: TransportArgs,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli
        .transport
        .into_config(cli.address.ip().to_string(), cli.address.port());
    let client = Client::connect(config)?;

    let kind = client.wait_call(&PING);
    if kind != ReturnType::Success {
        return Err(format!("ping failed: {kind:?}").into());
    }

    let text = "x".repeat(cli.payload_size);
    let start = Instant::now();
    for _ in 0..cli.calls {
        let echoed: ReturnValue<String> = client.wait_get_output(&ECHO, &text);
        if echoed.value.as_deref() != Some(text.as_str()) {
            warn!("echo returned {:?}", echoed.kind);
        }
    }
    info!("{} blocking echoes in {:?}", cli.calls, start.elapsed());

    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    for n in 0..cli.calls {
        let tx = tx.clone();
        let kind = client.get_output(&ADD, &(n, n), move |sum: ReturnValue<u64>| {
            let _ = tx.send(sum.into_result());
        });
        if kind != ReturnType::Success {
            warn!("add {n} was not issued: {kind:?}");
        }
    }
    drop(tx);
    let failed = rx.iter().filter(Result::is_err).count();
    info!(
        "{} async additions in {:?}, {failed} failed",
        cli.calls,
        start.elapsed()
    );

    let (tx, rx) = mpsc::channel();
    for _ in 0..cli.calls {
        let tx = tx.clone();
        client.notify(&NOTIFY, &1_u64, move |kind| {
            let _ = tx.send(kind);
        });
        client.notify_only(&NOTIFY, &1_u64);
    }
    drop(tx);
    let acknowledged = rx.iter().filter(|kind| kind.is_success()).count();

    let count: ReturnValue<u64> = client.wait_get(&COUNT);
    println!(
        "acknowledged {acknowledged} notifications, server counter {:?}, {} batches sent",
        count.value,
        client.connection().send_count()
    );

    client.close();
    Ok(())
}
