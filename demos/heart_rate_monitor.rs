use std::{sync::Arc, time::Duration};
use tokio::time::interval;
use tracing::{error, info, warn};
use wearlink::{
    BleTransport, ConnectionStatus, ConnectivityController, ControllerConfig, HeartRateMeasurement,
    Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("❤️  Wearlink Heart Rate Monitor Example");

    let transport = Arc::new(BleTransport::new().await);
    transport.set_heart_rate_callback(Arc::new(
        |device_id: &str, measurement: &HeartRateMeasurement| {
            let contact = match measurement.sensor_contact {
                Some(true) => "contact",
                Some(false) => "no contact",
                None => "contact n/a",
            };
            println!("💓 {device_id}: {} bpm ({contact})", measurement.bpm);
        },
    ));
    transport.set_battery_level_callback(Arc::new(|device_id: &str, level: u8| {
        println!("🔋 {device_id}: {level}%");
    }));

    let controller = ConnectivityController::with_config(transport, ControllerConfig::default());
    if !controller.is_supported() {
        error!("❌ No Bluetooth adapter available");
        return Ok(());
    }

    info!("🔍 Searching for heart rate monitors...");
    let device = match controller.request_device().await {
        Ok(device) => device,
        Err(e) => {
            error!("❌ No device selected: {}", e);
            return Err(e);
        }
    };

    info!("🔗 Connecting to {}...", device.display_name());
    if let Err(e) = controller.connect(&device.id).await {
        error!("❌ Failed to connect: {}", e);
        controller.teardown().await;
        return Err(e);
    }

    if let Some(connected) = controller.connected_device().await {
        let info = &connected.information;
        info!(
            "✅ Connected: {} {} (firmware {})",
            info.manufacturer.as_deref().unwrap_or("unknown"),
            info.model.as_deref().unwrap_or("device"),
            info.firmware_version.as_deref().unwrap_or("n/a")
        );
    }

    info!("Press Ctrl+C to stop monitoring");
    let mut status = controller.watch_status();
    let mut summary = interval(Duration::from_secs(10));
    summary.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping...");
                break;
            }
            Ok(()) = status.changed() => {
                let current = *status.borrow_and_update();
                info!("📶 Status: {}", current);
                if current != ConnectionStatus::Connected {
                    warn!("❌ Session ended");
                    break;
                }
            }
            _ = summary.tick() => {
                let snapshot = controller.snapshot().await;
                let rates: Vec<u16> = snapshot
                    .fitness_data
                    .iter()
                    .filter_map(|sample| sample.heart_rate)
                    .collect();
                if let (Some(min), Some(max)) = (rates.iter().min(), rates.iter().max()) {
                    let total: f64 = rates.iter().map(|&r| f64::from(r)).sum();
                    let avg = total / rates.len() as f64;
                    let count = rates.len();
                    println!("📈 {count} samples, min {min} / avg {avg:.0} / max {max} bpm");
                }
            }
        }
    }

    info!("🔌 Disconnecting...");
    if let Err(e) = controller.disconnect(&device.id).await {
        error!("❌ Failed to disconnect: {}", e);
    }
    controller.teardown().await;
    info!("👋 Done");

    Ok(())
}
