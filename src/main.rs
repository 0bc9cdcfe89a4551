use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use plantscan::camera_device::device_for;
use plantscan::render::render_snapshot;
use plantscan::{
    Config, HttpPredictionClient, ImageSource, MediaCaptureController, Phase,
    PredictionWorkflow, SelectedFile,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("🌿 Starting plantscan");

    // Load configuration
    let config = Config::load()?;

    // Initialize components
    let source = ImageSource::from_config(&config);
    let camera = MediaCaptureController::new(device_for(&config.camera), source.clone());
    info!("Camera backend: {}", camera.device_name());
    let classifier = Arc::new(HttpPredictionClient::new(&config)?);
    info!("Classifier endpoint: {}", classifier.url());

    let mut workflow =
        PredictionWorkflow::new(camera, source, classifier, config.workflow.auto_predict);

    let result = match std::env::args().nth(1) {
        Some(path) => classify_once(&mut workflow, &path).await,
        None => run_interactive(&mut workflow).await,
    };

    workflow.shutdown();
    info!("plantscan shut down gracefully");
    result
}

/// Classify a single file and print every candidate.
async fn classify_once(workflow: &mut PredictionWorkflow, path: &str) -> Result<()> {
    let file = SelectedFile::read(path)?;
    workflow.select_file(&file);
    workflow.predict();
    workflow.settle().await;
    workflow.toggle_show_all();

    let snapshot = workflow.snapshot();
    println!("{}", render_snapshot(&snapshot));

    match snapshot.error {
        Some(error) => Err(error).with_context(|| format!("Failed to identify {}", path)),
        None => Ok(()),
    }
}

enum Command {
    Open,
    Capture,
    Cancel,
    File(String),
    Predict,
    Reset,
    Toggle,
    Preview,
    Status,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word {
            "open" | "camera" => Some(Command::Open),
            "capture" | "snap" => Some(Command::Capture),
            "cancel" => Some(Command::Cancel),
            "file" | "upload" if !rest.is_empty() => Some(Command::File(rest.to_string())),
            "predict" => Some(Command::Predict),
            "reset" => Some(Command::Reset),
            "toggle" => Some(Command::Toggle),
            "preview" => Some(Command::Preview),
            "status" | "" => Some(Command::Status),
            "help" | "?" => Some(Command::Help),
            "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  open           open the camera");
    println!("  capture        take a photo and identify it");
    println!("  cancel         close the camera");
    println!("  file <path>    identify an image file");
    println!("  predict        identify the selected image (when auto_predict is off)");
    println!("  reset          start over");
    println!("  toggle         show or hide alternative predictions");
    println!("  preview        print the current image as a data URI");
    println!("  status         show the current state");
    println!("  quit           exit");
}

async fn run_interactive(workflow: &mut PredictionWorkflow) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_help();
    println!("{}", render_snapshot(&workflow.snapshot()));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read command")? else {
                    break;
                };

                match Command::parse(&line) {
                    Some(Command::Open) => workflow.open_camera(),
                    Some(Command::Capture) => workflow.capture(),
                    Some(Command::Cancel) => workflow.cancel_camera(),
                    Some(Command::File(path)) => match SelectedFile::read(&path) {
                        Ok(file) => workflow.select_file(&file),
                        Err(e) => {
                            println!("{:#}", e);
                            continue;
                        }
                    },
                    Some(Command::Predict) => workflow.predict(),
                    Some(Command::Reset) => workflow.reset(),
                    Some(Command::Toggle) => workflow.toggle_show_all(),
                    Some(Command::Preview) => {
                        match workflow.snapshot().image {
                            Some(image) => println!("{}", image.to_data_uri()),
                            None => println!("No image selected"),
                        }
                        continue;
                    }
                    Some(Command::Status) => {}
                    Some(Command::Help) => {
                        print_help();
                        continue;
                    }
                    Some(Command::Quit) => break,
                    None => {
                        println!("Unknown command: {} (try `help`)", line.trim());
                        continue;
                    }
                }
                println!("{}", render_snapshot(&workflow.snapshot()));
            }
            Some(event) = workflow.next_event() => {
                let before = workflow.phase();
                workflow.apply(event);
                if workflow.phase() != before || before == Phase::CameraActive {
                    println!("{}", render_snapshot(&workflow.snapshot()));
                }
            }
        }
    }

    Ok(())
}
