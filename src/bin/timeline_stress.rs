//! Stress driver for the timeline engine.
//!
//! Creates one release fence per frame, then fires frame-done interrupts from
//! a separate thread and checks every fence signals and every listener retires.
//!
//! Usage: timeline_stress [FRAMES]
//!
//! Every fence holds an fd, so FRAMES is bounded by the open file limit.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use dpu_fence::{
    acquire_fence, release_fence, FenceFdTable, IsrSource, Timeline, TimelineConfig,
};

const FRAME_DONE: u32 = 0;

fn main() {
    let frames: u32 = match std::env::args().nth(1).map(|arg| arg.parse()) {
        None => 512,
        Some(Ok(n)) => n,
        Some(Err(e)) => {
            eprintln!("[stress] ERROR: invalid frame count: {}", e);
            std::process::exit(2);
        }
    };
    eprintln!("[stress] Starting timeline stress with {} frames", frames);

    let isr = IsrSource::new("dpu0");
    let config = TimelineConfig::from_env();
    let timeline = match Timeline::new("dpu0-present", FRAME_DONE, &isr, config) {
        Ok(tl) => Arc::new(tl),
        Err(e) => {
            eprintln!("[stress] Timeline error: {}", e);
            std::process::exit(1);
        }
    };
    let fds = FenceFdTable::new();

    let start = Instant::now();
    let mut created = Vec::with_capacity(frames as usize);
    for id in 0..frames {
        match release_fence::create(&timeline, &fds, id) {
            Ok(fence) => created.push(fence),
            Err(e) => {
                eprintln!("[stress] Release fence {} failed: {} (errno {})", id, e, e.errno());
                std::process::exit(1);
            }
        }
    }
    eprintln!(
        "[stress] Created {} release fences in {:.1}ms",
        created.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );

    // Frame-done interrupts
    let vsync = {
        let timeline = Arc::clone(&timeline);
        let isr = isr.clone();
        thread::spawn(move || {
            for _ in 0..frames {
                timeline.mark_step_pending();
                isr.notify(FRAME_DONE);
            }
        })
    };

    let mut failures = 0usize;
    if let Some(last) = created.last() {
        if let Err(e) = acquire_fence::wait_fd(&fds, last.fd, 5_000) {
            eprintln!("[stress] Last fence did not signal: {}", e);
            failures += 1;
        }
    }
    if vsync.join().is_err() {
        eprintln!("[stress] Interrupt thread panicked");
        failures += 1;
    }
    timeline.flush();

    for fence in &created {
        match fds.poll(fence.fd, 0) {
            Ok(true) => {}
            Ok(false) => failures += 1,
            Err(e) => {
                eprintln!("[stress] Poll of fd {} failed: {}", fence.fd, e);
                failures += 1;
            }
        }
    }

    let elapsed = start.elapsed();
    eprintln!("[stress] {}", timeline.snapshot());
    eprintln!(
        "[stress] Done. {} frames in {:.1}ms, {} unsignaled, {} listeners left",
        frames,
        elapsed.as_secs_f64() * 1000.0,
        failures,
        timeline.pending_listeners()
    );

    if failures > 0 || timeline.pending_listeners() > 0 {
        std::process::exit(1);
    }
}
