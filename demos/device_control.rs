/**
 * Device Control Example
 *
 * Demonstrates the fundamental ways to control a Tuya device: `set_value`
 * for a single DP update, `set_dps` for several at once, and `status` to
 * read back the merged DP cache.
 */
use serde_json::json;
use tokio::time::{Duration, sleep};
use tuyalan::Device;

#[tokio::main]
async fn main() {
    println!("--- tuyalan - Device Control ---");

    let id = "eb5176f91956a97b165dc5";
    let key = "FGhe;!?GLh$vv9<c";
    let device = Device::new(id, "Auto", key, "3.3");

    println!("[STEP 1] Switching ON (using set_value)...");
    match device.set_value(1, json!(true)).await {
        Ok(()) => println!("[SUCCESS] Device acknowledged the command"),
        Err(e) => eprintln!("[ERROR] Control failed: {:?}", e),
    }

    sleep(Duration::from_secs(1)).await;

    println!("[STEP 2] Switching OFF (using set_dps)...");
    match device.set_dps(json!({"1": false})).await {
        Ok(()) => println!("[SUCCESS] Device acknowledged the command"),
        Err(e) => eprintln!("[ERROR] Control failed: {:?}", e),
    }

    println!("[STEP 3] Querying current status...");
    match device.status().await {
        Ok(dps) => println!("[SUCCESS] Status: {}", dps),
        Err(e) => eprintln!("[ERROR] Status query failed: {:?}", e),
    }

    device.stop().await;
    println!("[INFO] Example finished.");
}
