/**
 * Device Control Example
 *
 * Connects to a device, toggles a datapoint with a caller-side retry loop and
 * prints status updates for a minute.
 *
 * Usage: device_control <address> <device_id> <local_key> [version] [dps]
 */
use futures_util::StreamExt;
use localtuya::{Device, DeviceBuilder, TuyaError, Version};
use log::{info, warn};
use serde_json::Value;
use std::time::Duration;

const SET_ATTEMPTS: u32 = 5;

/// Reconnects and resends until the device accepts the value.
async fn set_with_retry(builder: impl Fn() -> DeviceBuilder, device: &mut Device, dps: &str, value: Value) {
    for attempt in 1..=SET_ATTEMPTS {
        match device.set_dps(value.clone(), dps).await {
            Ok(Some(res)) => {
                println!("[SUCCESS] Set dps {} -> {} (reply: {})", dps, value, res);
                return;
            }
            Ok(None) => println!("[INFO] Set dps {}: connection closed before reply", dps),
            Err(e) if e.is_retryable() => {
                if attempt == 3 {
                    warn!("Failed to set dps {} after {} attempts: {}", dps, attempt, e);
                }
            }
            Err(e) => {
                eprintln!("[ERROR] Set dps {} failed: {}", dps, e);
                return;
            }
        }

        device.close().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        match builder().connect().await {
            Ok(d) => *device = d,
            Err(e) => info!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
    eprintln!("[ERROR] Giving up on dps {} after {} attempts", dps, SET_ATTEMPTS);
}

#[tokio::main]
async fn main() -> Result<(), TuyaError> {
    env_logger::init();
    println!("--- localtuya {} - Device Control ---", localtuya::VERSION);

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("Usage: {} <address> <device_id> <local_key> [version] [dps]", args[0]);
        return Ok(());
    }
    let (address, id, key) = (args[1].clone(), args[2].clone(), args[3].clone());
    let version: Version = args.get(4).map(String::as_str).unwrap_or("3.3").parse()?;
    let dps = args.get(5).cloned().unwrap_or_else(|| "1".to_string());

    let builder = || {
        DeviceBuilder::new(id.clone(), key.clone())
            .address(address.clone())
            .version(version)
            .dps_to_request([dps.clone()])
    };

    println!("[INFO] Connecting to device {} at {} (v{})...", id, address, version);
    let mut device = builder()
        .listener(|status| println!("[EVENT] {}", status))
        .connect()
        .await?;

    let current = match device.status().await? {
        Some(status) => status["dps"][dps.as_str()].clone(),
        None => Value::Null,
    };
    println!("[INFO] dps {} is currently {}", dps, current);

    let next = match current {
        Value::Bool(on) => Value::Bool(!on),
        other => other,
    };
    set_with_retry(builder, &mut device, &dps, next).await;

    println!("[INFO] Waiting for updates (60s)...");
    let stream = device.stream();
    tokio::pin!(stream);
    let timeout = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            Some(status) = stream.next() => println!("[STREAM] {}", status),
            _ = &mut timeout => break,
            else => break,
        }
    }

    println!("[INFO] Cached dps: {:?}", device.cached_dps());
    device.close().await;
    Ok(())
}
