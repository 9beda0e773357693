use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use model_api::{
    adapters::OrtAdapter,
    config::{Config, OnnxConfig},
    image::{ImageLoader, InferenceResult, OutputFormat, ResultFormatter},
    models::{ExportRegistry, ModelParams},
    web::serve,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "model-api")]
#[command(about = "ONNX model wrappers for detection, segmentation, pose and BERT models")]
struct Args {
    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the loaded models over HTTP
    Serve {
        /// Server bind address
        #[arg(long, default_value = "0.0.0.0:5005")]
        bind: String,

        /// Model directory path
        #[arg(long, default_value = "models")]
        models_dir: String,

        /// Model to load as ARCHITECTURE=PATH, e.g. YOLOX=yolox_s.onnx (repeatable)
        #[arg(long = "model")]
        models: Vec<String>,

        /// Number of worker threads
        #[arg(long)]
        workers: Option<usize>,

        /// Maximum inference requests in flight
        #[arg(long)]
        max_async_requests: Option<usize>,

        /// Enable development mode
        #[arg(long)]
        dev: bool,
    },

    /// Print the published names and their defining modules
    List,

    /// Run one image through a model and print the result
    Run {
        /// Published wrapper name, e.g. SSD
        #[arg(long)]
        model: String,

        /// ONNX model file
        #[arg(long)]
        weights: PathBuf,

        #[arg(long)]
        image: PathBuf,

        /// JSON parameter file; defaults to the weights path with a .json extension
        #[arg(long)]
        params: Option<PathBuf>,

        /// json, csv or text
        #[arg(long, default_value = "json")]
        output_format: String,

        #[arg(long)]
        min_confidence: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Serve {
            bind,
            models_dir,
            models,
            workers,
            max_async_requests,
            dev,
        } => {
            tracing::info!("Starting model-api service...");
            tracing::info!("Bind address: {}", bind);
            tracing::info!("Models directory: {}", models_dir);

            let config = Config::new(bind, models_dir, &models, workers, max_async_requests, dev)?;
            serve(config).await?;
        }
        Command::List => {
            let registry = ExportRegistry::global()?;
            for export in registry.exports() {
                println!("{:<32} {:<36} {}", export.name, export.module, export.kind.as_str());
            }
        }
        Command::Run {
            model,
            weights,
            image,
            params,
            output_format,
            min_confidence,
        } => {
            let format: OutputFormat = output_format.parse()?;
            let params_path = params.unwrap_or_else(|| weights.with_extension("json"));
            let params = ModelParams::load_optional(&params_path)
                .with_context(|| format!("reading {}", params_path.display()))?;

            let onnx_config = OnnxConfig {
                intra_threads: num_cpus::get(),
                ..OnnxConfig::default()
            };
            let adapter = Arc::new(OrtAdapter::new(&weights, &onnx_config)?);
            let wrapper = ExportRegistry::global()?.create_model(&model, adapter, &params)?;

            let start_time = Instant::now();
            let decoded = ImageLoader::from_path(&image).with_context(|| format!("opening {}", image.display()))?;
            let (width, height) = (decoded.width() as usize, decoded.height() as usize);
            let array = ImageLoader::preprocess_for(decoded, wrapper.input_channels()?)?;
            let mut output = wrapper.infer_image(&array)?;
            if let Some(min_confidence) = min_confidence {
                output = output.filter_confidence(min_confidence);
            }

            let result = InferenceResult {
                model: weights
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| model.clone()),
                architecture: wrapper.architecture(),
                processing_time: start_time.elapsed().as_secs_f32(),
                image_size: [width, height],
                result: output,
            };
            tracing::info!(
                "{} finished in {:.3}s: {}",
                result.architecture,
                result.processing_time,
                ResultFormatter::summary(&result.result)
            );
            print!("{}", ResultFormatter::format(&result, format)?);
        }
    }

    Ok(())
}
