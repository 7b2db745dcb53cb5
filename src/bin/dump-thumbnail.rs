use docopt::Docopt;
use gpu_capture::CaptureFile;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use std::fs;

static USAGE: &str = "
Extract the thumbnail from a capture file.

Every capture embeds a small JPEG image of the frame as it was presented.
Write it to <out>.

Usage:
  dump-thumbnail <file> <out>
";

#[derive(Debug, Deserialize)]
struct Args {
    arg_file: String,
    arg_out: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let file = CaptureFile::open(&args.arg_file)?;
    match file.thumbnail {
        Some(thumbnail) => {
            fs::write(&args.arg_out, &thumbnail.jpeg)?;
            println!("wrote {}x{} thumbnail to {}", thumbnail.width, thumbnail.height, args.arg_out);
            Ok(())
        }
        None => Err(format!("{} has no thumbnail", args.arg_file).into()),
    }
}
