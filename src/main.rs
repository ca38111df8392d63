use card_alignment::config::load_config_or_default;
use card_alignment::logging::{init_logging, LoggingConfig};
use card_alignment::pipeline::{AlignmentPipeline, Decision, Diagnostics};
use card_alignment::templates::TemplateStore;
use card_alignment::FeatureExtractor;
use card_alignment::imaging;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "cardalign")]
#[command(about = "Template-based alignment engine for identity-document photos")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Align a document photo against the template for its type label
    Align {
        /// Directory holding one reference image per document-type label
        #[arg(short = 'd', long)]
        template_dir: PathBuf,

        /// Document-type label selecting the template
        #[arg(short, long)]
        label: String,

        /// Path to the input photo
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for the chosen (aligned or original) image
        #[arg(short, long)]
        output: PathBuf,

        /// Optional output file for the diagnostics record (JSON)
        #[arg(long)]
        diagnostics: Option<PathBuf>,
    },

    /// Extract features from an image and report detector statistics
    Features {
        /// Path to the image
        #[arg(short, long)]
        input: PathBuf,
    },

    /// List the document-type labels available in a template directory
    Templates {
        /// Directory holding one reference image per document-type label
        #[arg(short = 'd', long)]
        template_dir: PathBuf,
    },
}

/// One CLI run's result record, written next to the output image when
/// requested.
#[derive(Serialize)]
struct AlignmentRecord<'a> {
    label: &'a str,
    input: String,
    output: String,
    created_at: chrono::DateTime<chrono::Utc>,
    elapsed_ms: f64,
    diagnostics: &'a Diagnostics,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        global_level: match cli.verbose {
            0 => "warn".to_string(),
            1 => "info".to_string(),
            2 => "debug".to_string(),
            _ => "trace".to_string(),
        },
        ..LoggingConfig::default()
    };
    let _log_guard = init_logging(&logging)?;

    let config = load_config_or_default(cli.config.as_deref());

    match cli.command {
        Commands::Align { template_dir, label, input, output, diagnostics } => {
            let start = Instant::now();
            let store = Arc::new(TemplateStore::open(&template_dir, &config));
            let pipeline = AlignmentPipeline::new(store, config);

            let photo = image::open(&input)?.to_rgb8();
            let alignment = pipeline.align(&photo, &label)?;
            alignment.image.save(&output)?;

            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            match alignment.diagnostics.decision {
                Decision::Aligned => println!(
                    "aligned: {} matches, {} inliers, quality {}/100 ({:.0} ms)",
                    alignment.diagnostics.good_matches,
                    alignment.diagnostics.inliers,
                    alignment.diagnostics.quality_score,
                    elapsed_ms
                ),
                Decision::Original => println!(
                    "kept original: {} ({:.0} ms)",
                    alignment.diagnostics.reason.as_deref().unwrap_or("unknown"),
                    elapsed_ms
                ),
            }

            if let Some(path) = diagnostics {
                let record = AlignmentRecord {
                    label: &label,
                    input: input.display().to_string(),
                    output: output.display().to_string(),
                    created_at: chrono::Utc::now(),
                    elapsed_ms,
                    diagnostics: &alignment.diagnostics,
                };
                std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
                println!("diagnostics written to {}", path.display());
            }
        }

        Commands::Features { input } => {
            let photo = image::open(&input)?.to_rgb8();
            let (normalized, scale) =
                imaging::normalize_size(&photo, config.pipeline.target_dimension);
            let enhanced =
                imaging::enhance::enhance(&imaging::to_luma(&normalized), &config.enhance);
            let extractor = FeatureExtractor::new(config.detector.clone());
            let features = extractor.extract(&enhanced);

            println!(
                "{}: {}x{} (scale {:.3}), {} features",
                input.display(),
                photo.width(),
                photo.height(),
                scale,
                features.len()
            );
            for keypoint in features.keypoints.iter().take(10) {
                println!(
                    "  ({:7.2}, {:7.2}) level {} response {:.1}",
                    keypoint.x, keypoint.y, keypoint.level, keypoint.response
                );
            }
        }

        Commands::Templates { template_dir } => {
            let store = TemplateStore::open(&template_dir, &config);
            let labels = store.labels()?;
            if labels.is_empty() {
                println!("no templates found in {}", template_dir.display());
            }
            for label in labels {
                println!("{}", label);
            }
        }
    }

    Ok(())
}
