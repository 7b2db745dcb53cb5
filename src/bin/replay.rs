use docopt::Docopt;
use gpu_capture::{pixels, Replayer, ResourceId, SoftDriver};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

static USAGE: &str = "
Replay a capture on the software driver, and save a render target as PNG.

By default the whole frame is replayed, and the back buffer it presented is
saved. Use --event to stop after a given event, and --resource to save some
other texture, by its ID in the capture.

Usage:
  replay [options] <file>

Options:
  --event=<n>      Replay up to and including event <n>.
  --output=<png>   Where to write the image [default: replay.png].
  --resource=<id>  The texture to save.
";

#[derive(Debug, Deserialize)]
struct Args {
    arg_file: String,
    flag_event: Option<u32>,
    flag_output: String,
    flag_resource: Option<u64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let mut replayer = Replayer::open(SoftDriver::new(), &args.arg_file)?;
    let last = replayer.event_count() - 1;
    let end = args.flag_event.unwrap_or(last).min(last);
    replayer.replay_log(0, end, false)?;

    let texture = match args.flag_resource.map(ResourceId::from_raw).or_else(|| replayer.backbuffer()) {
        Some(texture) => texture,
        None => return Err("the capture presented no back buffer; pick a texture with --resource".into()),
    };
    let (desc, texels) = replayer.read_texture(texture, 0)?;
    let rgba = pixels::to_rgba8(desc.format, desc.width, desc.height, &texels)
        .ok_or_else(|| format!("can't convert {:?} texels to an image", desc.format))?;
    pixels::write_png(&args.flag_output, desc.width, desc.height, &rgba)?;

    let name = replayer.resource_name(texture).unwrap_or("unnamed");
    println!(
        "replayed {} of {} events of frame {}; wrote {} ({}) to {}",
        end + 1,
        last + 1,
        replayer.frame_info().frame_number,
        texture,
        name,
        args.flag_output
    );
    Ok(())
}
