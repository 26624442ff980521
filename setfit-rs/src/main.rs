//! CLI entry point for setfit-rs.

use std::fs::File;
use std::io::{BufWriter, Write};

use clap::{Parser, Subcommand};
use rand::SeedableRng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use setfit_rs::dataset::{prepare_split, Dataset, DatasetSource};
use setfit_rs::model::SeededRng;
use setfit_rs::pairs::PairGenerator;
use setfit_rs::{Result, SetFitConfig};

#[derive(Parser)]
#[command(name = "setfit")]
#[command(about = "Few-shot contrastive fine-tuning for sentence-embedding classifiers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "setfit.yaml")]
        output: String,
        /// Training preset (cosine, batch-hard, supcon)
        #[arg(long, default_value = "cosine")]
        preset: String,
    },
    /// Write the contrastive pairs generated from the training dataset
    Pairs {
        /// Path to configuration file
        #[arg(long)]
        config: String,
        /// Output JSONL file
        #[arg(long)]
        output: String,
        /// Generate multi-label pairs from multi-hot labels
        #[arg(long)]
        multi_label: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = SetFitConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Loss: {}", config.training.loss.unwrap_or_default());
            println!("  Metric: {}", config.metric);
            println!(
                "  Train dataset: {}",
                config.train_dataset.as_deref().unwrap_or_default()
            );
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = SetFitConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Pairs {
            config,
            output,
            multi_label,
        } => {
            let config = SetFitConfig::from_file(&config)?;
            config.validate()?;
            let path = config.train_dataset.as_deref().unwrap_or_default();
            tracing::info!("Generating pairs from: {}", path);

            let source: DatasetSource = Dataset::from_jsonl(path)?.into();
            let (texts, labels) = prepare_split(&source, config.training.column_mapping.as_ref())?;

            let multi_label = multi_label || config.multi_target_strategy.is_some();
            let mut rng = SeededRng::seed_from_u64(config.training.seed);
            let pairs = PairGenerator::new(multi_label).with_progress_bar(true).generate(
                &texts,
                &labels,
                config.training.num_iterations,
                &mut rng,
            )?;

            let mut writer = BufWriter::new(File::create(&output)?);
            for pair in &pairs {
                writeln!(writer, "{}", serde_json::to_string(pair)?)?;
            }
            writer.flush()?;
            println!("✓ Wrote {} pairs to: {output}", pairs.len());
        }
    }

    Ok(())
}
