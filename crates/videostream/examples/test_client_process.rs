use std::time::Instant;
use videostream::{
    client::{Client, Reconnect},
    timestamp,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let socket_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/vsl_separate_process_test.sock".to_string());
    let frame_count: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    println!("[CLIENT] Starting client process");
    println!("[CLIENT] Socket: {}", socket_path);
    println!("[CLIENT] Expected frames: {}", frame_count);

    // Wait a bit for host to start
    std::thread::sleep(std::time::Duration::from_millis(500));

    println!("[CLIENT] Connecting to host...");
    let client = Client::new(&socket_path, Reconnect::Enabled)?;
    println!("[CLIENT] Connected");

    let mut received = 0;
    let mut total_bytes = 0u64;
    let start = Instant::now();
    let mut last_frame_time = Instant::now();

    println!("[CLIENT] Starting receive loop...");
    while received < frame_count {
        let before_wait = Instant::now();
        let deadline = timestamp()? + 10_000_000_000;

        match client.wait(deadline) {
            Ok(frame) => {
                let wait_duration = before_wait.elapsed();
                received += 1;

                let size = frame.size() as u64;
                total_bytes += size;

                let frame_interval = last_frame_time.elapsed();
                last_frame_time = Instant::now();

                if wait_duration.as_millis() > 100 || received < 5 || received % 20 == 0 {
                    println!(
                        "[CLIENT] Frame {}: serial={}, wait={}ms, interval={}ms, size={}",
                        received,
                        frame.serial(),
                        wait_duration.as_millis(),
                        frame_interval.as_millis(),
                        size
                    );
                }

                if wait_duration.as_millis() > 500 {
                    println!(
                        "[CLIENT] WARNING: Frame {} wait took {}ms!",
                        received,
                        wait_duration.as_millis()
                    );
                }
            }
            Err(e) => {
                println!("[CLIENT] Error receiving frame {}: {}", received + 1, e);
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
    }

    let duration = start.elapsed();
    println!(
        "[CLIENT] Received {} frames in {:.2}s",
        received,
        duration.as_secs_f64()
    );
    println!(
        "[CLIENT] Throughput: {:.1} FPS, {:.2} MB total",
        received as f64 / duration.as_secs_f64(),
        total_bytes as f64 / 1_000_000.0
    );

    Ok(())
}
