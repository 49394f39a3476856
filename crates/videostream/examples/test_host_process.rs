use std::time::Instant;
use videostream::{frame::Frame, host, timestamp};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let socket_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/vsl_separate_process_test.sock".to_string());
    let frame_count: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    println!("[HOST] Starting host process");
    println!("[HOST] Socket: {}", socket_path);
    println!("[HOST] Frame count: {}", frame_count);

    println!("[HOST] Creating host...");
    let host = host::Host::new(&socket_path)?;
    println!("[HOST] Host created at {}", socket_path);

    // Give client time to connect
    std::thread::sleep(std::time::Duration::from_millis(1000));

    let width = 1280u32;
    let height = 720u32;
    let stride = width * 2; // YUYV: 2 bytes/pixel

    let start = Instant::now();
    for i in 0..frame_count {
        let before_alloc = Instant::now();
        let frame = Frame::new(width, height, stride, "YUYV")?;
        frame.alloc(None)?;
        {
            let buf = frame.mmap_mut()?;
            buf.fill((i % 256) as u8);
        }
        let alloc_time = before_alloc.elapsed();

        let before_post = Instant::now();
        let now = timestamp()?;
        let expires = now + 5_000_000_000; // 5 second expiration
        let serial = host.post(frame, expires, -1, -1, -1)?;
        let post_time = before_post.elapsed();

        host.process()?;

        if i < 5 || i % 20 == 0 {
            println!(
                "[HOST] Frame {}: serial={}, alloc={}μs, post={}μs",
                i + 1,
                serial,
                alloc_time.as_micros(),
                post_time.as_micros()
            );
        }

        std::thread::sleep(std::time::Duration::from_millis(33));
    }

    let duration = start.elapsed();
    println!(
        "[HOST] Completed {} frames in {:.2}s ({:.1} FPS)",
        frame_count,
        duration.as_secs_f64(),
        frame_count as f64 / duration.as_secs_f64()
    );

    println!("[HOST] Waiting for client to finish receiving...");
    for _ in 0..100 {
        host.process()?;
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    println!("[HOST] Done");
    Ok(())
}
