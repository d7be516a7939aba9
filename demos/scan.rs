//! Print every BLE device advertising nearby, strongest first. Use it to find the
//! name and address to put in `[ble]`.

use std::time::Duration;

use bmspoll::Scanner;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let mut scanner = bmspoll::BluestScanner::new(false).await?;
    let mut candidates = scanner.scan(Duration::from_secs(10)).await?;
    candidates.sort_by_key(|c| std::cmp::Reverse(c.rssi));
    for candidate in candidates {
        println!("{:>5} dBm  {}", candidate.rssi.map_or("?".to_string(), |r| r.to_string()), candidate.label());
    }
    Ok(())
}
