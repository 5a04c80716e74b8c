use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use layer_proxy::{
    Affine, BufferProxy, CompositorHandle, ContentType, FourCc, FrameRequests, HandoffConfig,
    ManualRunLoop, PaintOutcome, Rect, RemoteFramePresenter, RingOpts, RingProducer, SoftDevice,
    SoftFence, SoftTextureMapper, SwapOutcome, TextureBuffer, channel_pair,
};

const CLEAR: [u8; 4] = [18, 20, 28, 255];

#[derive(Parser, Debug)]
#[command(name = "layer-proxy", version)]
struct Cli {
    /// Log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive a cached proxy from a ring-buffer producer behind a request/reply transport.
    Remote(RemoteArgs),
    /// Drive a direct proxy from a producer thread, ending with a texture-preserving drop.
    Direct(DirectArgs),
}

#[derive(Parser, Debug)]
struct RemoteArgs {
    /// Hand-off config JSON. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frames to request.
    #[arg(long, default_value_t = 60)]
    frames: u64,

    /// Make the producer fail after this many frames.
    #[arg(long)]
    crash_after: Option<u64>,

    /// Write the last composited frame as a PNG.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct DirectArgs {
    /// Frames to produce.
    #[arg(long, default_value_t = 60)]
    frames: u64,

    /// Frame width and height in pixels.
    #[arg(long, default_value_t = 64)]
    size: u32,

    /// Delay between produced frames, in milliseconds.
    #[arg(long, default_value_t = 2)]
    interval_ms: u64,

    /// Write the last composited frame as a PNG.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.cmd {
        Command::Remote(args) => cmd_remote(args),
        Command::Direct(args) => cmd_direct(args),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn compositor(layer: &BufferProxy) -> anyhow::Result<(Arc<FrameRequests>, ManualRunLoop)> {
    let requests = Arc::new(FrameRequests::new());
    let run_loop = ManualRunLoop::new();
    layer.activate_on_compositor(CompositorHandle::new(
        requests.clone(),
        Arc::new(run_loop.clone()),
    ))?;
    Ok((requests, run_loop))
}

fn composite(layer: &BufferProxy, mapper: &mut SoftTextureMapper) -> anyhow::Result<bool> {
    let (w, h) = mapper.size();
    mapper.clear(CLEAR);
    let outcome = layer.paint(
        mapper,
        Rect::new(0.0, 0.0, f64::from(w), f64::from(h)),
        Affine::IDENTITY,
        1.0,
    )?;
    Ok(outcome == PaintOutcome::Painted)
}

fn cmd_remote(args: RemoteArgs) -> anyhow::Result<()> {
    let cfg = match &args.config {
        Some(path) => HandoffConfig::load(path)?,
        None => HandoffConfig::default(),
    };

    let device = SoftDevice::new();
    let (transport, endpoint) = channel_pair();
    let ring = RingProducer::new(
        device.clone(),
        RingOpts {
            fail_after: args.crash_after,
            ..cfg.ring_opts()
        },
    )?;
    let producer = ring.spawn(endpoint);

    let mut presenter = RemoteFramePresenter::new(transport, cfg.presenter, cfg.cached)?;
    let layer = presenter.delegate().platform_layer();
    let (_requests, _run_loop) = compositor(&layer)?;
    let mut mapper = SoftTextureMapper::new(device.clone(), cfg.frame_width, cfg.frame_height);

    let mut painted = 0u64;
    for frame in 0..args.frames {
        if let Err(e) = presenter.prepare_for_display() {
            tracing::warn!(frame, error = %e, "remote context lost, stopping");
            break;
        }
        layer.swap_buffer();
        if composite(&layer, &mut mapper)? {
            painted += 1;
        }
    }

    let cached = presenter.delegate().proxy().cached_layer_count();
    let lost = presenter.is_context_lost();
    layer.invalidate();
    drop(presenter);
    let stats = producer
        .join()
        .map_err(|_| anyhow::anyhow!("ring producer panicked"))?;

    eprintln!(
        "painted {painted} frame(s), {} imported, {cached} cached layer(s), context lost: {lost}",
        device.import_count()
    );
    eprintln!(
        "producer: {} frame(s), {} recycled, {} overwritten",
        stats.frames, stats.recycled, stats.overwritten
    );

    if let Some(out) = &args.out {
        write_png(out, &mapper)?;
    }
    Ok(())
}

fn cmd_direct(args: DirectArgs) -> anyhow::Result<()> {
    if args.size == 0 {
        anyhow::bail!("--size must be non-zero");
    }
    let device = SoftDevice::new();
    let (layer, producer_end) = BufferProxy::direct(ContentType::Canvas);
    let (requests, run_loop) = compositor(&layer)?;
    let mut mapper = SoftTextureMapper::new(device.clone(), args.size, args.size);

    let producer = {
        let device = device.clone();
        let (frames, size) = (args.frames, args.size);
        let interval = Duration::from_millis(args.interval_ms);
        std::thread::spawn(move || -> layer_proxy::ProxyResult<u64> {
            let mut pushed = 0;
            for i in 0..frames {
                let obj = device.allocate(size, size, FourCc::ARGB8888)?;
                let shade = (i % 256) as u8;
                device.fill(&obj, [shade, 64, 255 - shade, 255])?;
                let image = device.import(&obj)?;

                let fence = SoftFence::new();
                fence.signal_after(Duration::from_millis(1));
                let buffer = TextureBuffer::new(image)
                    .with_fence(Arc::new(fence))
                    .with_backing(obj);
                if !producer_end.push_next_buffer(buffer) {
                    break;
                }
                pushed += 1;
                std::thread::sleep(interval);
            }
            producer_end.drop_current_buffer_while_preserving_texture(true);
            Ok(pushed)
        })
    };

    let mut swaps = 0u64;
    let mut painted = 0u64;
    loop {
        let finished = producer.is_finished();
        requests.wait(Duration::from_millis(10));
        run_loop.run_pending();
        if layer.swap_buffer() == SwapOutcome::Swapped {
            swaps += 1;
            if composite(&layer, &mut mapper)? {
                painted += 1;
            }
        }
        if finished {
            break;
        }
    }

    let pushed = producer
        .join()
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
    // The backing buffer is gone; the texture must still draw.
    let preserved = composite(&layer, &mut mapper)?;
    layer.invalidate();

    eprintln!(
        "pushed {pushed} frame(s), swapped {swaps}, painted {painted}, texture preserved: {preserved}"
    );
    if let Some(out) = &args.out {
        write_png(out, &mapper)?;
    }
    Ok(())
}

fn write_png(path: &Path, mapper: &SoftTextureMapper) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    let (w, h) = mapper.size();
    image::save_buffer_with_format(
        path,
        mapper.pixels(),
        w,
        h,
        image::ColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .with_context(|| format!("write png '{}'", path.display()))?;
    eprintln!("wrote {}", path.display());
    Ok(())
}
