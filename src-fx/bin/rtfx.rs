use clap::{Parser, Subcommand};
use crossbeam::channel;
use rtfx::kernel::SpatialSelection;
use rtfx::{
    AudioGraph, HostConfig, KernelManager, KernelSpectrum, LocalGraph, Pipeline, PipelineDriver,
    PipelineType, PluginConfig, PluginContext, PluginEvent, StreamEndpoint, Worker,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "rtfx")]
#[command(about = "Realtime effects host: kernel tools and a demo pipeline", long_about = None)]
struct Cli {
    /// Host configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage impulse response kernels
    Kernel {
        #[command(subcommand)]
        command: KernelCommands,
    },

    /// Run a render pipeline (gain -> convolver) on a test tone
    Demo {
        /// Kernel for the convolver stage
        #[arg(short, long)]
        kernel: Option<String>,

        /// Sample rate in Hz
        #[arg(short, long, default_value_t = 48000)]
        rate: u32,

        /// Host period in samples
        #[arg(short, long, default_value_t = 256)]
        period: usize,

        /// Duration in seconds
        #[arg(short, long, default_value_t = 2.0)]
        seconds: f32,
    },
}

#[derive(Subcommand)]
enum KernelCommands {
    /// Print rate, length, layout and spectrum peak of a kernel
    Info {
        name: String,

        /// Points on the spectrum axes
        #[arg(long, default_value_t = 1000)]
        points: usize,
    },

    /// Convolve two kernels into a new one
    Combine {
        first: String,
        second: String,
        output: String,
    },

    /// Copy a kernel file into the user directory
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// List kernels in the user directory
    List,
}

fn load_config(path: Option<&PathBuf>) -> Result<HostConfig, String> {
    let config = match path {
        Some(path) => HostConfig::load(path).map_err(|e| e.to_string())?,
        None => HostConfig::default(),
    };
    config.with_env().map_err(|e| e.to_string())
}

fn kernel_command(config: &HostConfig, command: KernelCommands) -> Result<(), String> {
    let manager =
        KernelManager::from_config(config, PipelineType::Output).map_err(|e| e.to_string())?;

    match command {
        KernelCommands::Info { name, points } => {
            let kernel = manager
                .try_load(&name, &SpatialSelection::default())
                .map_err(|e| e.to_string())?;
            let layout = if kernel.is_true_stereo() {
                "true stereo (LL, LR, RL, RR)"
            } else {
                "stereo"
            };
            println!("Kernel:   {}", kernel.name);
            if let Some(path) = &kernel.path {
                println!("Path:     {}", path.display());
            }
            println!("Rate:     {} Hz", kernel.rate);
            println!("Samples:  {}", kernel.len());
            println!("Duration: {:.3} s", kernel.duration());
            println!("Layout:   {}", layout);
            println!("Peak:     {:.4}", kernel.peak());
            match KernelSpectrum::compute(&kernel, points).and_then(|s| s.peak_frequency()) {
                Some(f) => println!("Spectral peak: {:.1} Hz", f),
                None => println!("Spectral peak: n/a (kernel too short)"),
            }
        }
        KernelCommands::Combine {
            first,
            second,
            output,
        } => {
            let combined = manager
                .combine(&first, &second, &output)
                .map_err(|e| e.to_string())?;
            println!(
                "Wrote '{}': {} samples, {} channels",
                output,
                combined.len(),
                combined.channel_count()
            );
        }
        KernelCommands::Import { file } => {
            let name = manager.import(&file).map_err(|e| e.to_string())?;
            println!("Imported as '{}'", name);
        }
        KernelCommands::List => {
            for name in manager.list().map_err(|e| e.to_string())? {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

/// Sine source paced at the period duration, output discarded
struct ToneEndpoint {
    rate: u32,
    period: usize,
    phase: f32,
    remaining: u64,
    running: Arc<AtomicBool>,
    next_deadline: Instant,
}

impl ToneEndpoint {
    const FREQUENCY: f32 = 440.0;
}

impl StreamEndpoint for ToneEndpoint {
    fn rate(&self) -> u32 {
        self.rate
    }

    fn period(&self) -> usize {
        self.period
    }

    fn capture(&mut self, left: &mut [f32], right: &mut [f32]) -> bool {
        if self.remaining == 0 || !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.remaining -= 1;

        let step = 2.0 * std::f32::consts::PI * Self::FREQUENCY / self.rate as f32;
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let s = 0.25 * self.phase.sin();
            *l = s;
            *r = s;
            self.phase = (self.phase + step) % (2.0 * std::f32::consts::PI);
        }

        let now = Instant::now();
        if self.next_deadline > now {
            thread::sleep(self.next_deadline - now);
        }
        self.next_deadline += Duration::from_secs_f64(self.period as f64 / self.rate as f64);
        true
    }

    fn playback(&mut self, _left: &[f32], _right: &[f32]) {}
}

fn demo(
    config: &HostConfig,
    kernel: Option<String>,
    rate: u32,
    period: usize,
    seconds: f32,
) -> Result<(), String> {
    if rate == 0 || period == 0 {
        return Err("rate and period must be positive".to_string());
    }
    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping...");
        handler_flag.store(false, Ordering::SeqCst);
    })
    .map_err(|e| format!("Failed to set Ctrl+C handler: {}", e))?;

    let worker = Worker::spawn(config.worker_queue).map_err(|e| e.to_string())?;
    let graph: Arc<dyn AudioGraph> = Arc::new(LocalGraph::new().map_err(|e| e.to_string())?);
    let kernels = Arc::new(
        KernelManager::from_config(config, PipelineType::Output).map_err(|e| e.to_string())?,
    );
    let (tx, rx) = channel::bounded(config.event_queue.max(1));
    let ctx = PluginContext::new(graph, worker.handle(), kernels, PipelineType::Output, config)
        .with_events(tx)
        .with_rate(rate);

    let mut chain = vec![PluginConfig::new("gain", json!({ "gain_db": -3.0 }))];
    if let Some(name) = kernel {
        chain.push(PluginConfig::new("convolver", json!({ "kernel_name": name })));
    }
    let pipeline = Arc::new(Pipeline::from_config(&chain, &ctx).map_err(|e| e.to_string())?);

    let periods = (seconds.max(0.0) as f64 * rate as f64 / period as f64).ceil() as u64;
    let endpoint = ToneEndpoint {
        rate,
        period,
        phase: 0.0,
        remaining: periods,
        running: Arc::clone(&running),
        next_deadline: Instant::now(),
    };
    let mut driver =
        PipelineDriver::spawn(Arc::clone(&pipeline), endpoint).map_err(|e| e.to_string())?;

    while !driver.is_finished() {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(PluginEvent::Ready { tag }) => println!("[{}] ready", tag),
            Ok(PluginEvent::LatencyChanged { tag, seconds }) => {
                println!("[{}] latency {:.2} ms", tag, seconds * 1000.0)
            }
            Ok(PluginEvent::KernelLoaded { tag, info }) => println!(
                "[{}] kernel loaded: {} Hz, {} samples, {:.3} s",
                tag, info.rate, info.samples, info.duration
            ),
            Ok(PluginEvent::KernelLoadFailed { tag, name }) => {
                println!("[{}] kernel '{}' could not be loaded, passing through", tag, name)
            }
            Ok(PluginEvent::EngineFailed { tag, reason }) => {
                println!("[{}] engine failed: {}", tag, reason)
            }
            Err(_) => {}
        }
    }

    let processed = driver.stop();
    println!(
        "Processed {} periods, total latency {:.2} ms",
        processed,
        pipeline.total_latency_seconds() * 1000.0
    );
    pipeline.shutdown();
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Kernel { command } => kernel_command(&config, command),
        Commands::Demo {
            kernel,
            rate,
            period,
            seconds,
        } => demo(&config, kernel, rate, period, seconds),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
