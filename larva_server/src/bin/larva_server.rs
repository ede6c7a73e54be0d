//! Larva counter web server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use env_logger::TimestampPrecision;
use larva_server::{
    config::{AppConfig, APP_NAME, VERSION},
    endpoints::{router, AppState},
    nn::{ModelSlot, YoloParams},
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the web page on
    #[clap(long, env = "LARVA_SERVER_ADDRESS", default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Path of the ONNX detection model
    #[clap(long, env = "LARVA_MODEL_PATH", default_value = "models/best-yolo11s.onnx")]
    model_path: PathBuf,

    /// Path of the logo shown in the sidebar
    #[clap(long, env = "LARVA_LOGO_PATH", default_value = "assets/logo-st-andrews.png")]
    logo_path: PathBuf,

    /// Side length of the square model input
    #[clap(long, env = "LARVA_INPUT_SIZE", default_value_t = 640)]
    input_size: u32,

    /// IoU above which overlapping detections are suppressed
    #[clap(long, env = "LARVA_MAX_IOU", default_value_t = 0.7)]
    max_iou: f32,

    /// Maximum number of detections per image
    #[clap(long, env = "LARVA_MAX_DETECTIONS", default_value_t = 10000)]
    max_detections: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    log::info!("Starting {} {}", APP_NAME, VERSION);

    // Load the model once, a failure is shown on the page instead of aborting
    let params = YoloParams {
        input_size: args.input_size,
        max_iou: args.max_iou,
        max_detections: args.max_detections,
    };
    let model_path = args.model_path.clone();
    let model = tokio::task::spawn_blocking(move || ModelSlot::load(model_path, params)).await?;

    let config = AppConfig {
        logo_path: Some(args.logo_path),
    };
    let state = Arc::new(AppState::new(model, config));

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .await?;

    Ok(())
}
