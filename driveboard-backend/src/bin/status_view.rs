//! Debug binary (`backend/tback.py` analog): connects directly to the
//! driveboard, polls the engine's published snapshot, and reprints the
//! boxed status dashboard in place every 500ms. No HTTP/WS/TCP surface
//! involved — this talks straight to a [`DriveboardHandle`].

use clap::Parser;
use driveboard_engine::{DriveboardHandle, EngineConfig};
use std::time::Duration;

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(about = "Live status dashboard for a connected driveboard")]
struct Args {
    /// Serial port to open, e.g. /dev/ttyACM0. Falls back to the
    /// platform default if omitted.
    #[arg(long)]
    port: Option<String>,

    #[arg(long, default_value_t = 57600)]
    baudrate: u32,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut config = EngineConfig::default();
    if args.port.is_some() {
        config.serial_port = args.port;
    }
    config.baudrate = args.baudrate;

    let driveboard = match DriveboardHandle::connect(config).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("could not open the driveboard serial port: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        ticker.tick().await;
        let latest = driveboard.latest();
        print!("\x1B[2J\x1B[H"); // clear screen, home cursor
        println!("driveboard: {:?}  job: {:.1}%", latest.state, latest.job_percent);
        match &latest.status {
            Some(status) => println!("{status}"),
            None => println!("(no status received yet)"),
        }
    }
}
