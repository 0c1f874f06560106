//! Line-oriented TCP G-code port (`backend/web.py`'s `GcodeTCPServer`):
//! each connection gets a version banner, then every line received is
//! dispatched straight to the engine.

use driveboard_engine::DriveboardHandle;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const VERSION_BANNER: &str = "# driveboard-backend\n";

pub async fn serve(listener: TcpListener, driveboard: DriveboardHandle) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "gcode tcp client connected");
        let handle = driveboard.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handle).await {
                tracing::warn!(%peer, error = %e, "gcode tcp client disconnected");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, driveboard: DriveboardHandle) -> std::io::Result<()> {
    stream.write_all(VERSION_BANNER.as_bytes()).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let response = match driveboard.submit_gcode_line(line).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "gcode line rejected");
                format!("error:{e}")
            }
        };
        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}
