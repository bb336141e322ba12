/// Modbus Serial Master Bench Tool
///
/// Sends one PDU to a serial slave and prints the response.
///
/// Usage: serial_master <port> <baud> <unit> <hex pdu> [rtu|ascii]
///
/// Example: serial_master /dev/ttyUSB0 19200 1 0300000002

use std::env;
use std::time::Instant;

use tracing_subscriber::EnvFilter;

use modbus_link::utils::format::{bytes_to_hex, format_duration};
use modbus_link::utils::validation::validate_slave_id;
use modbus_link::{
    console_logger, ConnectionConfig, FrameEncoding, LinkConnection, MasterOptions, ModbusMessage,
    ModbusSerialMaster,
};

fn usage() -> ! {
    eprintln!("Usage: serial_master <port> <baud> <unit> <hex pdu> [rtu|ascii]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 4 {
        usage();
    }

    let baud_rate: u32 = args[1].parse().unwrap_or_else(|_| usage());
    let unit: u8 = args[2].parse().unwrap_or_else(|_| usage());
    if unit != 0 {
        validate_slave_id(unit)?;
    }
    let pdu = hex::decode(args[3].replace(' ', ""))?;
    let encoding = args.get(4).map(|name| FrameEncoding::from_name(name)).unwrap_or_default();

    let config = match encoding {
        FrameEncoding::Rtu => ConnectionConfig::new(args[0].as_str(), baud_rate),
        FrameEncoding::Ascii => ConnectionConfig::ascii(args[0].as_str(), baud_rate),
    }
    .with_timeout_ms(1000);

    println!("{}", modbus_link::info());
    println!("Port: {} ({}, {})", config.port, config.line_settings(), config.encoding);

    // Frames go to stdout through the console logger
    let link = LinkConnection::serial(config);
    let mut master = ModbusSerialMaster::from_connection(link, MasterOptions::default())
        .with_logger(console_logger!());
    master.connect().await?;

    let request = ModbusMessage::new(unit, pdu);
    let start = Instant::now();
    let result = master.send(request).await;
    let elapsed = format_duration(start.elapsed());

    match result {
        Ok(Some(response)) => {
            println!(
                "Response from unit {} in {}: {}",
                response.unit_id,
                elapsed,
                bytes_to_hex(&response.pdu)
            );
            if let Some(exception) = response.exception_code() {
                println!("Exception: {}", exception);
            }
        }
        Ok(None) => println!("Broadcast sent in {}", elapsed),
        Err(e) => println!("Request failed after {}: {}", elapsed, e),
    }

    master.disconnect().await;
    Ok(())
}
