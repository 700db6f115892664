// Demo game loop: a handful of engine subsystems driven by the worker scheduler.
//
// Physics and terrain generation share the pool, the audio mixer owns a dedicated thread and
// render preparation is pumped from this (main) thread once per frame. Terrain generation streams
// chunks through the task runner. Scheduler statistics are logged as JSON once per second.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use subsystem_scheduler::{
    logging, PriorityLevel, SchedulerConfig, Task, TaskHandle, TaskRunner, TaskRunnerConfig,
    ThreadAffinity, TickResult, Worker, WorkerScheduler,
};
use tracing::{info, warn};

/// Command-line options parsed from program arguments.
struct CliOptions {
    /// Threads in the shared worker pool (default: available cores minus one)
    pool_threads: Option<usize>,
    /// Threads in the task runner (default: half the available cores)
    task_threads: Option<usize>,
    /// How long the demo runs before shutting down (default: 5 s)
    duration: Duration,
    /// Filter used when `RUST_LOG` is unset
    log_filter: String,
}

fn apply_option(options: &mut CliOptions, key: &str, value: &str) {
    match key {
        "--pool-threads" => options.pool_threads = value.parse().ok().or(options.pool_threads),
        "--task-threads" => options.task_threads = value.parse().ok().or(options.task_threads),
        "--duration-secs" => {
            if let Ok(secs) = value.parse::<f64>() {
                if secs.is_finite() && secs > 0.0 {
                    options.duration = Duration::from_secs_f64(secs);
                }
            }
        }
        "--log-filter" => options.log_filter = value.to_string(),
        _ => {}
    }
}

/// Parse `--key=value` and `--key value` arguments. Unknown keys and malformed values are ignored.
fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions {
        pool_threads: None,
        task_threads: None,
        duration: Duration::from_secs(5),
        log_filter: String::from("subsystem_scheduler=info,info"),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some((key, value)) = arg.split_once('=') {
            apply_option(&mut options, key, value);
        } else if arg.starts_with("--") {
            if let Some(value) = args.next() {
                apply_option(&mut options, &arg, &value);
            }
        }
    }
    options
}

/// Fixed-step rigid body integration stand-in.
struct Physics {
    bodies: Vec<(f64, f64)>,
}

impl Worker for Physics {
    fn name(&self) -> &str {
        "physics"
    }

    fn priority_level(&self) -> PriorityLevel {
        PriorityLevel::High
    }

    fn target_frequency_hz(&self) -> f64 {
        60.0
    }

    fn tick(&mut self, elapsed: Duration) -> TickResult {
        let dt = elapsed.as_secs_f64();
        for (position, velocity) in &mut self.bodies {
            *velocity -= 9.81 * dt;
            *position += *velocity * dt;
            if *position < 0.0 {
                *position = 0.0;
                *velocity = -*velocity * 0.8;
            }
        }
        Ok(())
    }
}

/// Finds chunks around the camera that are not generated yet and streams them as tasks.
struct Terrain {
    tasks: TaskHandle,
    next_chunk: u64,
    generated: Arc<AtomicU64>,
}

impl Worker for Terrain {
    fn name(&self) -> &str {
        "terrain"
    }

    fn priority_level(&self) -> PriorityLevel {
        PriorityLevel::Low
    }

    fn target_frequency_hz(&self) -> f64 {
        5.0
    }

    fn tick(&mut self, _elapsed: Duration) -> TickResult {
        for _ in 0..2 {
            self.tasks.enqueue(ChunkTask {
                label: format!("chunk-{}", self.next_chunk),
                passes_left: 3,
                generated: self.generated.clone(),
            })?;
            self.next_chunk += 1;
        }
        Ok(())
    }
}

/// Generates one terrain chunk over a few passes, then retires.
struct ChunkTask {
    label: String,
    passes_left: u32,
    generated: Arc<AtomicU64>,
}

impl Task for ChunkTask {
    fn name(&self) -> &str {
        &self.label
    }

    fn target_frequency_hz(&self) -> f64 {
        20.0
    }

    fn run(&mut self) -> TickResult {
        self.passes_left = self.passes_left.saturating_sub(1);
        if self.passes_left == 0 {
            self.generated.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn done(&self) -> bool {
        self.passes_left == 0
    }
}

/// Builds draw lists; must run on the thread that owns the graphics context.
struct RenderPrep {
    frames: u64,
}

impl Worker for RenderPrep {
    fn name(&self) -> &str {
        "render-prep"
    }

    fn priority_level(&self) -> PriorityLevel {
        PriorityLevel::Medium
    }

    fn target_frequency_hz(&self) -> f64 {
        30.0
    }

    fn thread_affinity(&self) -> ThreadAffinity {
        ThreadAffinity::MainOnly
    }

    fn tick(&mut self, _elapsed: Duration) -> TickResult {
        self.frames += 1;
        Ok(())
    }
}

/// Mixes voices into the output buffer; owns a thread-affine audio device.
struct AudioMixer {
    phase: f64,
}

impl Worker for AudioMixer {
    fn name(&self) -> &str {
        "audio-mixer"
    }

    fn priority_level(&self) -> PriorityLevel {
        PriorityLevel::High
    }

    fn target_frequency_hz(&self) -> f64 {
        50.0
    }

    fn thread_affinity(&self) -> ThreadAffinity {
        ThreadAffinity::Dedicated
    }

    fn tick(&mut self, elapsed: Duration) -> TickResult {
        self.phase = (self.phase + 440.0 * elapsed.as_secs_f64()).fract();
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = parse_cli_options();
    logging::init(&options.log_filter);

    let mut scheduler_config = SchedulerConfig::default();
    if let Some(threads) = options.pool_threads {
        scheduler_config.pool_threads = threads;
    }
    let mut runner_config = TaskRunnerConfig::default();
    if let Some(threads) = options.task_threads {
        runner_config.threads = threads;
    }

    let runner = TaskRunner::new(runner_config);
    let scheduler = WorkerScheduler::new(scheduler_config);
    let generated = Arc::new(AtomicU64::new(0));

    scheduler.register_worker(Physics {
        bodies: (0..64u32).map(|i| (f64::from(i), 0.0)).collect(),
    })?;
    scheduler.register_worker(Terrain {
        tasks: runner.handle(),
        next_chunk: 0,
        generated: generated.clone(),
    })?;
    scheduler.register_worker(AudioMixer { phase: 0.0 })?;
    scheduler.register_worker(RenderPrep { frames: 0 })?;

    runner.start()?;
    scheduler.start()?;
    info!(duration = ?options.duration, "demo running");

    let started = Instant::now();
    let mut last_report = started;
    while started.elapsed() < options.duration {
        if scheduler.pump_main_thread()?.is_none() {
            // Nothing due this frame; yield instead of spinning.
            thread::sleep(Duration::from_millis(1));
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            for stats in scheduler.stats() {
                if stats.starvation_risk {
                    warn!(worker = %stats.name, "worker at risk of starvation");
                }
                info!(stats = %serde_json::to_string(&stats)?, "worker");
            }
            info!(
                tasks = %serde_json::to_string(&runner.stats())?,
                chunks = generated.load(Ordering::Relaxed),
                "task runner"
            );
        }
    }

    scheduler.shutdown();
    runner.shutdown();
    info!(
        chunks = generated.load(Ordering::Relaxed),
        "demo finished"
    );
    Ok(())
}
