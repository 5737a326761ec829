use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use flexglove::csv_loader::load_training_csv;
use flexglove::gesture_classifier::GestureClassifier;

/// Replays a recorded dataset through the frozen pipeline.
#[derive(Parser, Debug)]
#[command(name = "replay_csv")]
struct Args {
    /// Dataset CSV (Thumb,Index,Middle,Ring,Pinky[,GyroX,GyroY,GyroZ])
    csv: PathBuf,

    #[arg(long, default_value = "models")]
    models: PathBuf,

    /// Cluster → gesture JSON; the built-in table when omitted
    #[arg(long)]
    map: Option<PathBuf>,

    /// Print the standardized feature vector of every row
    #[arg(long)]
    dump_features: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    println!("🎞️  Replaying {:?}", args.csv);

    let classifier = GestureClassifier::load(&args.models, args.map.as_deref())
        .context("loading classifier")?;
    let pipeline = classifier.pipeline();
    let feature_set = pipeline.feature_set();

    let mut dataset = load_training_csv(&args.csv)?;
    let dropped = dataset.clean();
    if dropped > 0 {
        println!("ℹ️  {} rows with all flex readings at zero skipped", dropped);
    }
    let rows = dataset.feature_matrix(feature_set)?;

    let mut tally: BTreeMap<String, usize> = BTreeMap::new();
    for (idx, (sample, features)) in dataset.samples.iter().zip(&rows).enumerate() {
        let label = classifier
            .classify_features(features)
            .with_context(|| format!("row {}", idx + 1))?;

        let command = label
            .command
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>5}: {:?} → cluster {} {:<14} {}",
            idx + 1,
            sample.flex,
            label.cluster,
            label.name,
            command
        );

        if args.dump_features {
            let z = pipeline.standardizer().transform(features)?;
            let formatted: Vec<String> = z.iter().map(|v| format!("{:>7.3}", v)).collect();
            println!("         z = [{}]", formatted.join(", "));
        }

        *tally.entry(label.name).or_insert(0) += 1;
    }

    println!("\n📊 {} rows replayed (run {})", rows.len(), pipeline.run_id());
    for (gesture, count) in &tally {
        let share = *count as f32 / rows.len().max(1) as f32 * 100.0;
        println!("  {:<14} {:>6} {:>6.1}%", gesture, count, share);
    }

    Ok(())
}
