//! CLI entry point for curriculum-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use curriculum_rs::dataset::{ImageDataset, IndexedDataset};
use curriculum_rs::model::Network;
use curriculum_rs::{CurriculumConfig, CurriculumError, CurriculumTrainer, Result};

#[derive(Parser)]
#[command(name = "curriculum")]
#[command(about = "Curriculum-learning stage and label correction for noisy-label classifiers")]
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
    /// Run the third training stage
    Train {
        /// Path to configuration file
        config: String,
        /// Run label correction afterwards
        #[arg(long)]
        correct: bool,
    },
    /// Run label correction on a saved network
    Correct {
        /// Path to configuration file
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Dataset preset (cifar10, cifar100)
        #[arg(long, default_value = "cifar10")]
        preset: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut stdout = std::io::stdout();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = CurriculumConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Train data: {}", config.dataset.train_path);
            println!("  Model: {:?}, {} classes", config.model.arch, config.model.num_classes);
            println!(
                "  Stage: {} epochs, curriculum {}",
                config.stage.epochs(),
                config.stage.curriculum
            );
        }
        Commands::Train { config, correct } => {
            tracing::info!("Starting training with config: {}", config);
            let config = CurriculumConfig::from_file(&config)?;
            let trainer = CurriculumTrainer::new(config)?;
            let outcome = trainer.run(correct, &mut stdout)?;
            println!("✓ Report saved to: {}", outcome.report_path.display());
        }
        Commands::Correct { config } => {
            tracing::info!("Starting label correction with config: {}", config);
            let config = CurriculumConfig::from_file(&config)?;
            let checkpoint = config.init_checkpoint.clone().ok_or_else(|| {
                CurriculumError::Config("init_checkpoint is required for correction".into())
            })?;
            let trainer = CurriculumTrainer::new(config)?;

            let train = ImageDataset::load(&trainer.config().dataset.train_path)?;
            if train.image_shape() != trainer.config().model.image_shape() {
                return Err(CurriculumError::Dataset(format!(
                    "train images are {:?} but the model expects {:?}",
                    train.image_shape(),
                    trainer.config().model.image_shape()
                )));
            }
            let mut network = Network::new(&trainer.config().model, trainer.device())?;
            network.load_weights(&checkpoint)?;

            let records = trainer.label_correction(&network, std::sync::Arc::new(train), &mut stdout)?;
            println!("✓ Label correction finished after {} epochs", records.len());
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = CurriculumConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
