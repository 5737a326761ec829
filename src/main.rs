/*
flexglove: flex-sensor glove → k-means gesture clusters → audio cues.

Typical session:
    flexglove capture --port /dev/ttyUSB0 --out data.csv --max-samples 3000
    flexglove train --data data.csv --k 6 --labeled-out data_labeled.csv
    (inspect the cluster report, write gesture_map.json with the printed run id)
    flexglove label --data data_labeled.csv --map gesture_map.json --out data_gestures.csv
    flexglove run --port /dev/ttyUSB0 --map gesture_map.json

`q` + Enter stops `capture` and `run`.
*/

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, info};

use flexglove::actuator::SerialSink;
use flexglove::capture::{capture_samples, convert_log};
use flexglove::config::AppConfig;
use flexglove::csv_loader::{
    load_cluster_column, load_training_csv, write_labeled_csv, LabeledRow, SampleCsvWriter,
};
use flexglove::gesture_classifier::GestureClassifier;
use flexglove::gesture_map::GestureMap;
use flexglove::inference::InferenceLoop;
use flexglove::model_store::ModelStore;
use flexglove::sample_parser::{LineSchema, SampleParser};
use flexglove::source::{open_serial, warm_up, SerialConfig};
use flexglove::training::fit_pipeline;

#[derive(Parser, Debug)]
#[command(name = "flexglove", version, about = "Flex-sensor glove gesture clustering and playback")]
struct Cli {
    /// JSON configuration file; defaults are used when omitted
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Default)]
struct PortArgs {
    /// Serial device, e.g. /dev/ttyUSB0 or COM5
    #[arg(long)]
    port: Option<String>,

    #[arg(long)]
    baud: Option<u32>,

    /// Line layout printed by the glove
    #[arg(long, value_enum)]
    schema: Option<SchemaArg>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SchemaArg {
    /// `<timestamp> thumb index middle ring pinky gx gy gz`
    Firmware,
    /// `thumb,index,middle,ring,pinky[,gx,gy,gz]`
    Bare,
}

impl From<SchemaArg> for LineSchema {
    fn from(arg: SchemaArg) -> Self {
        match arg {
            SchemaArg::Firmware => LineSchema::FIRMWARE,
            SchemaArg::Bare => LineSchema::BARE,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record live samples into a training CSV
    Capture {
        #[command(flatten)]
        serial: PortArgs,

        #[arg(long)]
        out: PathBuf,

        /// Stop after this many samples
        #[arg(long)]
        max_samples: Option<usize>,
    },

    /// Convert a firmware debug log into a training CSV
    ParseLog {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        out: PathBuf,
    },

    /// Fit the standardizer and k-means, save the paired artifacts
    Train {
        #[arg(long)]
        data: PathBuf,

        /// Number of clusters
        #[arg(long)]
        k: Option<usize>,

        /// Cluster on flex + gyro
        #[arg(long)]
        use_gyro: bool,

        #[arg(long)]
        models: Option<PathBuf>,

        /// Write the cleaned dataset with a `cluster` column here
        #[arg(long)]
        labeled_out: Option<PathBuf>,
    },

    /// Append gesture names to a CSV labeled by `train`
    Label {
        #[arg(long)]
        data: PathBuf,

        #[arg(long)]
        map: PathBuf,

        #[arg(long)]
        out: PathBuf,
    },

    /// Classify live samples and send play commands
    Run {
        #[command(flatten)]
        serial: PortArgs,

        #[arg(long)]
        models: Option<PathBuf>,

        #[arg(long)]
        map: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .init();

    let mut config = match cli.config.as_deref() {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            AppConfig::from_json(path)?
        }
        None => AppConfig::default(),
    };

    match cli.command {
        Command::Capture {
            serial,
            out,
            max_samples,
        } => {
            apply_port_args(&mut config.serial, serial);
            config.validate()?;
            capture(&config, out, max_samples)
        }
        Command::ParseLog { input, out } => {
            let stats = convert_log(&input, &out)?;
            println!(
                "✅ {} samples written to {:?} ({} of {} lines skipped)",
                stats.recorded, out, stats.skipped, stats.lines
            );
            Ok(())
        }
        Command::Train {
            data,
            k,
            use_gyro,
            models,
            labeled_out,
        } => {
            if let Some(k) = k {
                config.training.kmeans.k = k;
            }
            if use_gyro {
                config.training.use_gyro = true;
            }
            if let Some(dir) = models {
                config.paths.models_dir = dir;
            }
            config.validate()?;
            train(&config, data, labeled_out)
        }
        Command::Label { data, map, out } => label(data, map, out),
        Command::Run {
            serial,
            models,
            map,
        } => {
            apply_port_args(&mut config.serial, serial);
            if let Some(dir) = models {
                config.paths.models_dir = dir;
            }
            if map.is_some() {
                config.paths.gesture_map = map;
            }
            config.validate()?;
            run(&config)
        }
    }
}

fn apply_port_args(serial: &mut SerialConfig, args: PortArgs) {
    if let Some(port) = args.port {
        serial.port = port;
    }
    if let Some(baud) = args.baud {
        serial.baud_rate = baud;
    }
    if let Some(schema) = args.schema {
        serial.line_schema = schema.into();
    }
}

/// Fires once when the user types `q` + Enter. EOF on stdin never fires.
fn spawn_quit_watcher() -> Receiver<()> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(l) if l.trim().eq_ignore_ascii_case("q") => {
                    let _ = tx.send(());
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("stdin closed: {e}");
                    return;
                }
            }
        }
    });
    rx
}

fn capture(config: &AppConfig, out: PathBuf, max_samples: Option<usize>) -> Result<()> {
    let (mut source, _writer) = open_serial(&config.serial)?;
    println!("🔌 Connected to {} @ {} baud", config.serial.port, config.serial.baud_rate);

    let warm = Duration::from_millis(config.serial.warm_up_ms);
    println!("⏳ Warming up for {:.1} s...", warm.as_secs_f32());
    warm_up(&mut source, warm)?;

    let parser = SampleParser::new(config.serial.line_schema);
    let mut writer = SampleCsvWriter::create(&out, parser.schema().require_gyro)?;
    let shutdown = spawn_quit_watcher();

    println!("🎬 Recording to {:?} (q + Enter to stop)", out);
    let stats = capture_samples(&mut source, &parser, &mut writer, max_samples, &shutdown)?;

    println!(
        "✅ {} samples recorded ({} lines without a sample)",
        stats.recorded, stats.skipped
    );
    Ok(())
}

fn train(config: &AppConfig, data: PathBuf, labeled_out: Option<PathBuf>) -> Result<()> {
    let feature_set = config.training.feature_set();

    let mut dataset = load_training_csv(&data)?;
    let dropped = dataset.clean();
    println!(
        "📂 {} rows loaded from {:?} ({} all-zero rows dropped)",
        dataset.len(),
        data,
        dropped
    );

    let rows = dataset.feature_matrix(feature_set)?;
    let outcome = fit_pipeline(feature_set, &rows, config.training.kmeans.clone())
        .context("training failed")?;

    let store = ModelStore::new(&config.paths.models_dir);
    let run_id = store.save(
        &outcome.scaler,
        &outcome.fit.model,
        &outcome.config,
        outcome.rows(),
    )?;
    println!("💾 Artifacts saved to {:?} (run {})", store.dir(), run_id);

    if let Some(path) = labeled_out {
        let written = write_labeled_csv(
            &path,
            dataset.has_gyro,
            dataset
                .samples
                .iter()
                .zip(&outcome.fit.labels)
                .map(|(sample, &cluster)| LabeledRow {
                    sample,
                    cluster,
                    gesture: None,
                }),
        )?;
        println!("🏷️  {} labeled rows written to {:?}", written, path);
    }

    println!("\n{}", outcome.report());
    println!(
        "\nMap clusters to gestures in a JSON file with \"model_run_id\": \"{}\"",
        run_id
    );
    Ok(())
}

fn label(data: PathBuf, map_path: PathBuf, out: PathBuf) -> Result<()> {
    let dataset = load_training_csv(&data)?;
    let clusters = load_cluster_column(&data)?;
    if clusters.len() != dataset.len() {
        bail!(
            "{:?}: {} samples but {} cluster ids",
            data,
            dataset.len(),
            clusters.len()
        );
    }

    let map = GestureMap::from_json(&map_path)
        .with_context(|| format!("loading gesture map {:?}", map_path))?;
    let labels: Vec<_> = clusters.iter().map(|&c| map.lookup(c)).collect();

    let written = write_labeled_csv(
        &out,
        dataset.has_gyro,
        dataset
            .samples
            .iter()
            .zip(&labels)
            .map(|(sample, label)| LabeledRow {
                sample,
                cluster: label.cluster,
                gesture: Some(label.name.as_str()),
            }),
    )?;

    let unknown = labels.iter().filter(|l| l.is_unknown()).count();
    println!("🏷️  {} rows written to {:?} ({} unknown)", written, out, unknown);
    Ok(())
}

fn run(config: &AppConfig) -> Result<()> {
    let classifier =
        GestureClassifier::load(&config.paths.models_dir, config.paths.gesture_map.as_deref())?;
    println!("✅ Model loaded (run {})", classifier.pipeline().run_id());

    let (mut source, writer) = open_serial(&config.serial)?;
    println!("🔌 Connected to {} @ {} baud", config.serial.port, config.serial.baud_rate);

    let warm = Duration::from_millis(config.serial.warm_up_ms);
    println!("⏳ Warming up for {:.1} s...", warm.as_secs_f32());
    warm_up(&mut source, warm)?;

    let shutdown = spawn_quit_watcher();
    let mut inference = InferenceLoop::new(
        source,
        SerialSink::new(writer),
        classifier,
        SampleParser::new(config.serial.line_schema),
        config.inference.clone(),
    );

    println!("🎬 Recognizing gestures (q + Enter to stop)\n");
    let stats = inference.run(&shutdown)?;

    println!("\n👋 Stopped after {} lines", stats.lines);
    println!(
        "   classified {}, played {}, suppressed {}, skipped {}",
        stats.classified, stats.actuated, stats.suppressed, stats.skipped
    );
    for (gesture, count) in &stats.gestures {
        println!("   {:<14} {:>6}", gesture, count);
    }
    Ok(())
}
