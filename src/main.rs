use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::{Parser, ValueEnum};
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nano_batch::core::completion::ResponseReceiver;
use nano_batch::{
    Backend, BackendError, Batch, Completion, DynamicBatchingConfig, InferenceRequest,
    InputConfig, ModelConfig, ModelScheduler, Outcome, OutputTensor, SequenceBatchingConfig,
    SequenceFlags,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Dynamic,
    Sequence,
}

#[derive(Parser, Debug)]
#[command(name = "nano-batch")]
#[command(about = "Drive the batching scheduler with synthetic load")]
struct Args {
    /// Model configuration file (JSON); a built-in config is used otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Built-in configuration to use when no file is given
    #[arg(long, value_enum, default_value = "dynamic")]
    mode: Mode,

    /// Number of producer threads
    #[arg(short, long, default_value = "4")]
    producers: usize,

    /// Requests per producer (sequences per producer in sequence mode)
    #[arg(short = 'n', long, default_value = "64")]
    requests: usize,

    /// Requests per sequence
    #[arg(long, default_value = "4")]
    sequence_length: usize,

    /// Simulated backend latency per batch, in microseconds
    #[arg(long, default_value = "2000")]
    latency_us: u64,

    /// Random extra latency per batch, in microseconds
    #[arg(long, default_value = "500")]
    jitter_us: u64,

    /// Fraction of batches the simulated backend fails
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,
}

/// Backend that sleeps like a model would, then echoes its inputs.
struct SimulatedBackend {
    latency: Duration,
    jitter_us: u64,
    failure_rate: f64,
}

impl Backend for SimulatedBackend {
    fn execute(&self, _instance: usize, batch: &Batch) -> Result<Vec<Outcome>, BackendError> {
        let mut rng = rand::thread_rng();
        let jitter = if self.jitter_us > 0 {
            Duration::from_micros(rng.gen_range(0..self.jitter_us))
        } else {
            Duration::ZERO
        };
        thread::sleep(self.latency + jitter);
        if self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate.min(1.0)) {
            return Err(BackendError::new("simulated device failure"));
        }

        let stacked = batch.stacked_input("INPUT0")?;
        let doubled = (stacked * 2.0)?;
        let mut outcomes = Vec::with_capacity(batch.num_requests());
        for (row, entry) in batch.entries().iter().enumerate() {
            if entry.is_padding() {
                continue;
            }
            outcomes.push(Ok(vec![OutputTensor::new("OUTPUT0", doubled.get(row)?)]));
        }
        Ok(outcomes)
    }
}

fn builtin_config(mode: Mode) -> ModelConfig {
    let inputs = vec![InputConfig {
        name: "INPUT0".into(),
        dims: vec![16],
    }];
    match mode {
        Mode::Dynamic => ModelConfig {
            name: "simulated-dynamic".into(),
            max_batch_size: 16,
            instance_count: 2,
            inputs,
            dynamic_batching: Some(DynamicBatchingConfig {
                preferred_batch_size: vec![4, 8],
                max_queue_delay_micros: 500,
                ..Default::default()
            }),
            sequence_batching: None,
        },
        Mode::Sequence => ModelConfig {
            name: "simulated-sequence".into(),
            max_batch_size: 8,
            instance_count: 1,
            inputs,
            dynamic_batching: None,
            sequence_batching: Some(SequenceBatchingConfig {
                max_candidate_sequences: 8,
                ..Default::default()
            }),
        },
    }
}

fn input() -> Result<Tensor> {
    Ok(Tensor::ones(16, DType::F32, &Device::Cpu)?)
}

/// Submit this producer's share of the load, returning the receivers.
fn produce(
    scheduler: &ModelScheduler,
    producer: usize,
    args: &Args,
    sequences: bool,
) -> Result<Vec<ResponseReceiver>> {
    let base = (producer * args.requests * args.sequence_length.max(1)) as u64;
    let mut receivers = Vec::new();
    let mut next_id = base;
    for i in 0..args.requests {
        let steps = if sequences { args.sequence_length.max(1) } else { 1 };
        for step in 0..steps {
            let (completion, rx) = Completion::channel();
            let mut request = InferenceRequest::new(next_id, completion).with_input("INPUT0", input()?);
            if sequences {
                let flags = SequenceFlags {
                    start: step == 0,
                    end: step + 1 == steps,
                };
                request = request.with_sequence(base + i as u64 + 1, flags);
            }
            next_id += 1;
            // Rejections are reported through the receiver as well.
            let _ = scheduler.submit(request);
            receivers.push(rx);
        }
    }
    Ok(receivers)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let args = Args::parse();
    println!("nano-batch v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => ModelConfig::from_json_file(path)
            .with_context(|| format!("loading model config {}", path.display()))?,
        None => builtin_config(args.mode),
    };
    let sequences = config.sequence_batching.is_some();
    let backend = Arc::new(SimulatedBackend {
        latency: Duration::from_micros(args.latency_us),
        jitter_us: args.jitter_us,
        failure_rate: args.failure_rate,
    });
    let scheduler = ModelScheduler::start(config, backend).context("starting scheduler")?;
    info!(model = scheduler.name(), producers = args.producers, "starting load");

    let started = Instant::now();
    let receivers = thread::scope(|scope| -> Result<Vec<ResponseReceiver>> {
        let handles: Vec<_> = (0..args.producers)
            .map(|producer| {
                let scheduler = &scheduler;
                let args = &args;
                scope.spawn(move || produce(scheduler, producer, args, sequences))
            })
            .collect();
        let mut all = Vec::new();
        for handle in handles {
            let receivers = handle
                .join()
                .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
            all.extend(receivers);
        }
        Ok(all)
    })?;

    let (mut ok, mut failed) = (0usize, 0usize);
    for rx in receivers {
        match rx.recv() {
            Ok(_) => ok += 1,
            Err(err) => {
                if failed == 0 {
                    warn!(code = err.code(), error = %err, "first failed request");
                }
                failed += 1;
            }
        }
    }
    let elapsed = started.elapsed();
    let stats = scheduler.statistics();
    scheduler.shutdown();

    println!(
        "\n{} succeeded, {} failed in {:.1?} ({:.0} req/s), average batch size {:.2}",
        ok,
        failed,
        elapsed,
        (ok + failed) as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        stats.average_batch_size()
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
