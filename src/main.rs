use std::path::PathBuf;

use clap::Parser;
use transcode_bus::{RunState, TranscodeJob, TranscodeListener};

mod config;

use config::TranscoderConfig;

/// Transcodes one media file into the container and codecs of an encoding profile.
///
/// Decoding and encoding need the FFmpeg backend: build with `--features ffmpeg`.
/// Without it every run ends with a configuration error.
#[derive(Parser, Debug)]
#[command(name = "transcoder", version)]
struct Args {
    /// Input media file
    #[arg(long)]
    source: Option<String>,

    /// Output file
    #[arg(long)]
    destination: Option<String>,

    /// JSON file with `bus` and `profile` sections
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("transcode_bus", log::LevelFilter::Info)
        .filter_module("transcoder", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn exit_with(message: &str) -> ! {
    eprintln!("{}", message);
    std::process::exit(1);
}

/// `ERROR: <message>`, followed by the cause on its own line when there is one.
fn error_report(message: &str, debug: Option<&str>) -> String {
    match debug {
        Some(debug) if !debug.is_empty() && debug != message => {
            format!("ERROR: {}\n  caused by: {}", message, debug)
        }
        _ => format!("ERROR: {}", message),
    }
}

/// Prints the run to the terminal.
struct ConsoleListener;

impl TranscodeListener for ConsoleListener {
    fn started(&mut self) {
        println!("started");
    }

    fn progress(&mut self, fraction: f64) {
        println!("progress: {:.0}%", fraction * 100.0);
    }

    fn eos(&mut self) {
        println!("EOS");
    }

    fn error(&mut self, kind: &str, message: &str, debug: Option<&str>) {
        log::debug!("run ended with a {} error", kind);
        eprintln!("{}", error_report(message, debug));
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let Some(source) = args.source else {
        exit_with("no source location supplied");
    };
    let Some(destination) = args.destination else {
        exit_with("no destination location supplied");
    };

    init_logging();
    let config = match &args.config {
        Some(path) => TranscoderConfig::load(path).unwrap_or_else(|e| exit_with(&e.to_string())),
        None => TranscoderConfig::default(),
    };
    if let Err(e) = transcode_bus::init() {
        exit_with(&format!("{:#}", e));
    }

    let mut handle = TranscodeJob::new(&source, &destination)
        .with_profile(config.profile)
        .with_config(config.bus)
        .start()
        .unwrap_or_else(|e| exit_with(&e.to_string()));

    let stopper = handle.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, stopping");
            stopper.stop().await;
        }
    });

    let state = handle.run_with(&mut ConsoleListener).await;
    let final_state = handle.wait().await;
    log::debug!("run ended as {:?}", final_state);
    if state != RunState::Finished {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::error_report;

    #[test]
    fn test_error_report_shows_the_cause() {
        let report = error_report(
            "Failed to start",
            Some("could not open in.mkv: could not open in.mkv for reading"),
        );
        assert_eq!(
            report,
            "ERROR: Failed to start\n  caused by: could not open in.mkv: could not open in.mkv for reading"
        );
    }

    #[test]
    fn test_error_report_without_details() {
        assert_eq!(error_report("Aborted", None), "ERROR: Aborted");
        assert_eq!(error_report("Aborted", Some("")), "ERROR: Aborted");
    }
}
