use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{EngineConfig, FaceEngine};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face enrollment and recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add training images for a subject
    Enroll {
        /// Subject identifier (student id)
        subject_id: String,
        /// One or more single-face images
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Recompute a subject's templates from its stored samples
    Retrain {
        subject_id: String,
    },
    /// List a subject's stored training samples
    Samples {
        subject_id: String,
    },
    /// Delete one training sample and recompute the subject's templates
    DeleteSample {
        subject_id: String,
        /// Sample file name, as shown by `samples`
        sample: String,
    },
    /// Delete all training data for a subject
    DeleteAll {
        subject_id: String,
    },
    /// Recognize faces in an image
    Recognize {
        image: PathBuf,
        /// Process at most this many detected faces
        #[arg(long)]
        max_faces: Option<usize>,
    },
    /// Show engine status
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let engine = FaceEngine::open(EngineConfig::from_env()).context("failed to open engine")?;

    if engine.degraded_mode() {
        eprintln!("warning: embedding model unavailable — running in degraded pixel-matching mode");
    }

    match cli.command {
        Commands::Enroll { subject_id, images } => {
            for path in &images {
                let image = load_grayscale(path)?;
                let sample = engine
                    .enroll(&subject_id, &image)
                    .with_context(|| format!("enrolling {}", path.display()))?;
                println!("{}", serde_json::json!({ "enrolled": sample.0, "from": path }));
            }
            println!(
                "{}",
                serde_json::json!({
                    "subject_id": subject_id,
                    "samples": engine.samples(&subject_id)?.len(),
                    "is_trained": engine.is_trained(&subject_id),
                })
            );
        }
        Commands::Retrain { subject_id } => {
            let summary = engine.retrain(&subject_id)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Samples { subject_id } => {
            let samples = engine.samples(&subject_id)?;
            println!("{}", serde_json::to_string_pretty(&samples)?);
        }
        Commands::DeleteSample { subject_id, sample } => {
            engine.delete_sample(&subject_id, &rollcall_core::SampleRef(sample.clone()))?;
            println!("{}", serde_json::json!({ "deleted": sample }));
        }
        Commands::DeleteAll { subject_id } => {
            let deleted = engine.delete_all(&subject_id)?;
            println!("{}", serde_json::json!({ "subject_id": subject_id, "deleted": deleted }));
        }
        Commands::Recognize { image, max_faces } => {
            let image = load_grayscale(&image)?;
            let result = engine.recognize(&image, max_faces)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Status => {
            let status = engine.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn load_grayscale(path: &PathBuf) -> Result<image::GrayImage> {
    let image = image::open(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(image.to_luma8())
}
