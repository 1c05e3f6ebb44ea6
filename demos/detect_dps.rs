/**
 * Datapoint Detection Example
 *
 * Loads a device from a JSON config file and lists the datapoints it reports.
 *
 * Usage: detect_dps <config.json>
 *
 * {"id": "...", "address": "192.168.1.20", "local_key": "...", "version": "3.3"}
 */
use localtuya::{DeviceConfig, TuyaError};

#[tokio::main]
async fn main() -> Result<(), TuyaError> {
    env_logger::init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("Usage: detect_dps <config.json>");
        return Ok(());
    };
    let json = std::fs::read_to_string(&path)?;
    let config = DeviceConfig::from_json(&json)?;

    println!("[INFO] Connecting to {} at {}...", config.id, config.address);
    let device = config.builder().connect().await?;

    let dps = device.detect_available_dps().await?;
    println!("[INFO] Device type: {}", device.dev_type());
    for (index, value) in &dps {
        println!("  dps {:>3} = {}", index, value);
    }

    device.close().await;
    Ok(())
}
