/// Modbus Serial Listener Bench Tool
///
/// Answers every addressed request with an exception until Ctrl-C.
///
/// Usage: serial_listener <port> <baud> [rtu|ascii]

use std::env;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use modbus_link::{
    ConnectionConfig, ExceptionResponder, FrameEncoding, ModbusException, ModbusSerialListener,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 2 {
        eprintln!("Usage: serial_listener <port> <baud> [rtu|ascii]");
        std::process::exit(2);
    }

    let baud_rate: u32 = args[1].parse()?;
    let encoding = args.get(2).map(|name| FrameEncoding::from_name(name)).unwrap_or_default();
    let config = match encoding {
        FrameEncoding::Rtu => ConnectionConfig::new(args[0].as_str(), baud_rate),
        FrameEncoding::Ascii => ConnectionConfig::ascii(args[0].as_str(), baud_rate),
    };

    let responder = Arc::new(ExceptionResponder::new(ModbusException::ServerDeviceFailure));
    let listener = ModbusSerialListener::serial(config, responder);
    let handle = listener.handle();
    let mut task = listener.spawn();

    let listener = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutting down");
            handle.stop();
            task.await?
        }
        joined = &mut task => joined?,
    };
    if let Some(message) = listener.error() {
        error!("{}", message);
    }
    info!(
        "Handled {} requests, {} failed",
        handle.requests_handled(),
        handle.requests_failed()
    );
    Ok(())
}
