use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};

use vitals_core::detection::domain::face_detector::DetectorFactory;
use vitals_core::detection::infrastructure::onnx_blazeface_detector::BlazefaceDetectorFactory;
use vitals_core::estimation::domain::estimation_backend::{
    BackendFactory, Credentials, EstimationBackend, EstimationError,
};
use vitals_core::estimation::infrastructure::pos_estimator::PosEstimator;
use vitals_core::estimation::infrastructure::remote_estimator::RemoteEstimator;
use vitals_core::pipeline::events::{Event, EventKind};
use vitals_core::pipeline::session_config::SessionConfig;
use vitals_core::pipeline::session_state::SessionState;
use vitals_core::pipeline::streaming_controller::{StreamSource, StreamingController};
use vitals_core::shared::constants::BLAZEFACE_MODEL_NAME;
use vitals_core::shared::model_resolver;
use vitals_core::video::domain::video_decoder::{MediaSource, VideoDecoder};
use vitals_core::video::infrastructure::ffmpeg_decoder::FfmpegDecoder;

/// Pulse and respiration from facial video.
#[derive(Parser)]
#[command(name = "vitals")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print stream metadata as JSON.
    Probe {
        /// Input file or URL.
        input: String,
    },
    /// Process a whole file and print the aggregated result as JSON.
    Process {
        /// Input file or URL.
        input: String,

        #[command(flatten)]
        session: SessionArgs,
    },
    /// Play the input as a live stream and print events as JSON lines.
    Stream {
        /// Input file or URL.
        input: String,

        /// Stop after this many seconds (default: until the input ends).
        #[arg(long)]
        seconds: Option<f64>,

        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Local,
    Remote,
}

#[derive(Args)]
struct SessionArgs {
    /// Session config JSON (default: the platform config dir).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Face detection model (.onnx). Resolved from the cache when omitted.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Where to download the model from when it is not cached.
    #[arg(long)]
    model_url: Option<String>,

    /// Estimation backend.
    #[arg(long, value_enum, default_value = "local")]
    backend: Backend,

    /// Remote estimation endpoint (required with --backend remote).
    #[arg(long)]
    endpoint: Option<String>,

    /// API key for the remote backend.
    #[arg(long, env = "VITALS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Frames per estimation window.
    #[arg(long)]
    window: Option<usize>,

    /// Frames between window starts.
    #[arg(long)]
    stride: Option<usize>,

    /// Run detection every Nth frame (1 = every frame).
    #[arg(long)]
    detect_every: Option<usize>,

    /// Face detection confidence threshold (0.0-1.0).
    #[arg(long)]
    confidence: Option<f64>,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        Command::Probe { input } => {
            let metadata = FfmpegDecoder::new().probe(&media_source(&input))?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Command::Process { input, session } => {
            let mut controller = build_controller(&session)?;
            let result = controller.process_video_file(media_source(&input))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Stream {
            input,
            seconds,
            session,
        } => run_stream(&input, seconds, &session)?,
    }
    Ok(())
}

fn run_stream(
    input: &str,
    seconds: Option<f64>,
    session: &SessionArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut controller = build_controller(session)?;
    for kind in [EventKind::Vitals, EventKind::Warning, EventKind::Error] {
        controller.add_event_listener(kind, Arc::new(print_event))?;
    }

    controller.set_video_stream(StreamSource::Media(media_source(input)))?;
    controller.start_video_stream()?;

    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));
    while controller.state().is_running() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            controller.stop_video_stream()?;
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let result = controller.session_result()?;
    log::info!(
        "Stream ended: {} frames processed, {} dropped, {} estimates",
        result.frames_processed,
        result.frames_dropped,
        result.estimates.len()
    );
    if controller.state() != SessionState::Stopped {
        return Err(format!("session ended in state {}", controller.state()).into());
    }
    Ok(())
}

fn print_event(event: &Event) {
    let line = match event {
        Event::Vitals(estimate) => serde_json::json!({ "event": "vitals", "data": estimate }),
        Event::Warning(warning) => {
            serde_json::json!({ "event": "warning", "message": warning.to_string() })
        }
        Event::Error(error) => serde_json::json!({ "event": "error", "message": error.to_string() }),
    };
    println!("{line}");
}

fn build_controller(args: &SessionArgs) -> Result<StreamingController, Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let detectors: Arc<dyn DetectorFactory> = Arc::new(BlazefaceDetectorFactory::new(
        resolve_model(args)?,
        config.detection_confidence,
    ));
    let decoder: Arc<dyn VideoDecoder> = Arc::new(FfmpegDecoder::with_max_consecutive_errors(
        config.max_consecutive_decode_errors,
    ));
    let credentials = Credentials {
        api_key: args.api_key.clone(),
    };

    Ok(StreamingController::new(
        config,
        decoder,
        detectors,
        build_backends(args)?,
        credentials,
    )?)
}

fn load_config(args: &SessionArgs) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from(path)?,
        None => SessionConfig::load_or_default()?,
    };
    if let Some(window) = args.window {
        config.window_frames = window;
    }
    if let Some(stride) = args.stride {
        config.window_stride = stride;
    }
    if let Some(n) = args.detect_every {
        config.detect_every = n;
    }
    if let Some(confidence) = args.confidence {
        config.detection_confidence = confidence;
    }
    config.validate()?;
    Ok(config)
}

fn build_backends(args: &SessionArgs) -> Result<Arc<dyn BackendFactory>, Box<dyn std::error::Error>> {
    match args.backend {
        Backend::Local => Ok(Arc::new(
            || -> Result<Box<dyn EstimationBackend>, EstimationError> {
                Ok(Box::new(PosEstimator::default()))
            },
        )),
        Backend::Remote => {
            let endpoint = args
                .endpoint
                .clone()
                .ok_or("--endpoint is required with --backend remote")?;
            if args.api_key.is_none() {
                log::warn!("No API key given for the remote backend");
            }
            Ok(Arc::new(
                move || -> Result<Box<dyn EstimationBackend>, EstimationError> {
                    Ok(Box::new(RemoteEstimator::new(endpoint.clone())?))
                },
            ))
        }
    }
}

fn resolve_model(args: &SessionArgs) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(path) = &args.model {
        if !path.is_file() {
            return Err(format!("Model file not found: {}", path.display()).into());
        }
        return Ok(path.clone());
    }
    log::info!("Resolving model: {BLAZEFACE_MODEL_NAME}");
    let path = model_resolver::resolve(
        BLAZEFACE_MODEL_NAME,
        args.model_url.as_deref(),
        None,
        Some(Box::new(download_progress)),
    )?;
    Ok(path)
}

fn media_source(input: &str) -> MediaSource {
    if input.contains("://") {
        MediaSource::Url(input.to_string())
    } else {
        MediaSource::Path(PathBuf::from(input))
    }
}

fn download_progress(downloaded: u64, total: u64) {
    if total > 0 {
        let pct = (downloaded as f64 / total as f64 * 100.0) as u32;
        eprint!("\rDownloading face detection model... {pct}%");
    } else {
        eprint!("\rDownloading face detection model... {downloaded} bytes");
    }
}
