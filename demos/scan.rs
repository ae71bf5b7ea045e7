/**
 * Scanner Example
 *
 * Demonstrates using `Scanner` to find Tuya devices broadcasting on the
 * local network.
 */
use tuyalan::Scanner;

#[tokio::main]
async fn main() {
    println!("--- tuyalan - Scanner ---");
    println!("[INFO] Scanning the network for Tuya devices...");

    let scanner = Scanner::new();
    match scanner.scan().await {
        Ok(devices) => {
            for (i, device) in devices.iter().enumerate() {
                println!(
                    "[{}] Found Device: ID={}, IP={}, Version={:?}",
                    i + 1,
                    device.id,
                    device.ip,
                    device.version
                );
            }
            println!("[INFO] Scan finished. Total devices found: {}", devices.len());
        }
        Err(e) => eprintln!("[ERROR] Scan failed: {:?}", e),
    }
}
