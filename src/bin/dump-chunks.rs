use docopt::Docopt;
use gpu_capture::{CaptureFile, ChunkType, ReplayError};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

static USAGE: &str = "
Print the chunks of capture files.

Each chunk is printed with its offset in the chunk stream, its type and its
payload size. Chunks after the capture-scope chunk belong to the captured
frame, and are numbered with their event IDs.

Usage:
  dump-chunks <file>...
";

#[derive(Debug, Deserialize)]
struct Args {
    arg_file: Vec<String>,
}

fn dump(path: &str) -> Result<(), ReplayError> {
    let mut file = CaptureFile::open(path)?;
    println!("{}: container version {}", path, file.container_version);
    if let Some(thumbnail) = &file.thumbnail {
        println!(
            "thumbnail: {}x{}, {} bytes of JPEG",
            thumbnail.width,
            thumbnail.height,
            thumbnail.jpeg.len()
        );
    }

    let mut event = None;
    while !file.chunks.at_end() {
        let header = file.chunks.push_context()?;
        let name = header.chunk_type().map_or("<unknown>", ChunkType::name);
        match event {
            Some(id) => print!("{:>10} event {:>5}  ", header.offset, id),
            None => print!("{:>10}               ", header.offset),
        }
        println!("{:<20} {} bytes", name, header.payload_len());

        match header.chunk_type() {
            Some(ChunkType::InitParams) => {
                let mut payload = file.chunks.payload();
                println!("           format version {:#04x}", payload.field::<u32>("version")?);
            }
            Some(ChunkType::CaptureScope) => {
                let mut payload = file.chunks.payload();
                println!("           frame {}", payload.field::<u32>("frame_number")?);
                event = Some(0);
                file.chunks.skip_current_chunk();
                continue;
            }
            _ => {}
        }
        file.chunks.skip_current_chunk();
        event = event.map(|id| id + 1);
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let mut failed = false;
    for path in &args.arg_file {
        if let Err(err) = dump(path) {
            eprintln!("{}: {}", path, err);
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
}
