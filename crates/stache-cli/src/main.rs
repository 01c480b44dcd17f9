use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stache_core::{
    CompositeOutcome, Compositor, CompositorConfig, FaceDetector, FixedChooser, NoseDetector, OverlayChooser,
    OverlayLibrary, RandomChooser,
};
use stache_net::moderation::REJECT_ABOVE;
use stache_net::{ModerationService, VisionClient};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "stache", about = "Stache mustache compositor CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Put a mustache on every face in a local image
    Composite {
        input: PathBuf,
        output: PathBuf,
        /// Directory holding det_10g.onnx
        #[arg(long, env = "STACHE_MODEL_DIR")]
        model_dir: Option<PathBuf>,
        #[arg(long, env = "STACHE_OVERLAY_DIR")]
        overlay_dir: Option<PathBuf>,
        /// Seed the overlay choice for reproducible output
        #[arg(long, conflicts_with = "overlay")]
        seed: Option<u64>,
        /// Always use the overlay at this index (see `stache overlays`)
        #[arg(long)]
        overlay: Option<usize>,
        #[arg(long, default_value_t = 1)]
        max_noses: usize,
    },
    /// Run the safe-search check on an image URL
    Moderate {
        url: String,
        #[arg(long, env = "GOOGLE_VISION_API_KEY", hide_env_values = true)]
        api_key: String,
    },
    /// List the overlay images in load order
    Overlays {
        #[arg(long, env = "STACHE_OVERLAY_DIR")]
        overlay_dir: Option<PathBuf>,
    },
}

fn overlay_dir_or_default(dir: Option<PathBuf>) -> PathBuf {
    dir.unwrap_or_else(|| stache_core::default_data_dir().join("overlays"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Composite { input, output, model_dir, overlay_dir, seed, overlay, max_noses } => {
            let model_path = model_dir
                .unwrap_or_else(stache_core::default_model_dir)
                .join(stache_core::SCRFD_MODEL_FILE);
            let overlays = OverlayLibrary::load_dir(&overlay_dir_or_default(overlay_dir))?;
            let chooser: Box<dyn OverlayChooser + Send> = match (overlay, seed) {
                (Some(i), _) => Box::new(FixedChooser(i)),
                (None, Some(s)) => Box::new(RandomChooser::seeded(s)),
                (None, None) => Box::new(RandomChooser::from_entropy()),
            };
            let config = CompositorConfig { max_noses_per_face: max_noses, ..CompositorConfig::default() };
            composite(&model_path, overlays, chooser, config, &input, &output)?;
        }
        Commands::Moderate { url, api_key } => {
            let annotation = VisionClient::new(api_key)?.check(&url).await?;
            for (name, likelihood) in annotation.categories() {
                println!("{name:>9}: {likelihood}");
            }
            let flagged = annotation.flagged(REJECT_ABOVE);
            if flagged.is_empty() {
                println!("verdict: safe");
            } else {
                println!("verdict: unsafe ({})", flagged.join(", "));
            }
        }
        Commands::Overlays { overlay_dir } => {
            let dir = overlay_dir_or_default(overlay_dir);
            let library = OverlayLibrary::load_dir(&dir)?;
            println!("{} overlays in {}", library.len(), dir.display());
            for (i, name) in library.names().enumerate() {
                println!("{i:>3}  {name}");
            }
        }
    }

    Ok(())
}

fn composite(
    model_path: &Path,
    overlays: OverlayLibrary,
    chooser: Box<dyn OverlayChooser + Send>,
    config: CompositorConfig,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let faces = FaceDetector::load(model_path)?.with_min_size(30);
    let noses = NoseDetector::load(model_path)?;
    let mut compositor =
        Compositor::new(Box::new(faces), Box::new(noses), overlays, config).with_chooser(chooser);

    let outcome = compositor
        .composite(input, output)
        .with_context(|| format!("compositing {}", input.display()))?;
    match outcome {
        CompositeOutcome::NoFaces => println!("no faces found; nothing written"),
        CompositeOutcome::Written { faces, mustaches } => {
            println!("{faces} face(s), {mustaches} mustache(s) -> {}", output.display());
        }
    }
    Ok(())
}
