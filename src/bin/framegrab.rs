//! framegrab - capture frames from a V4L2 device
//!
//! Opens the device, negotiates the format, maps the buffer pool and runs the
//! acquisition loop until Ctrl-C, the frame limit, or a capture error. Frame
//! bytes can be appended to a file with `--dump`.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use framegrab::config::{parse_encoding, CaptureConfig};
use framegrab::{LoopExit, Session, TimeoutPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML config file; flags override its values.
    #[arg(long, env = "FRAMEGRAB_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Device node, or stub://<name> for the synthetic device.
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Pixel format name (yuyv, mjpeg, ...) or four-character code.
    #[arg(long, value_name = "FORMAT")]
    pixel_format: Option<String>,
    /// Buffers to request from the driver (at least 2).
    #[arg(long)]
    buffers: Option<u32>,
    /// Readiness wait per frame, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Consecutive timeouts to tolerate before giving up (0 = none).
    #[arg(long)]
    max_timeouts: Option<u32>,
    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,
    /// Append raw frame bytes to this file.
    #[arg(long, value_name = "PATH")]
    dump: Option<PathBuf>,
}

impl Args {
    fn apply(&self, cfg: &mut CaptureConfig) -> Result<()> {
        if let Some(device) = &self.device {
            cfg.device = device.clone();
        }
        if let Some(width) = self.width {
            cfg.format.width = width;
        }
        if let Some(height) = self.height {
            cfg.format.height = height;
        }
        if let Some(name) = &self.pixel_format {
            cfg.format.encoding = parse_encoding(name)?;
        }
        if let Some(buffers) = self.buffers {
            cfg.buffers = buffers;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            cfg.timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(max_timeouts) = self.max_timeouts {
            cfg.policy = TimeoutPolicy::from_max_timeouts(max_timeouts);
        }
        if self.frames.is_some() {
            cfg.frames = self.frames;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = CaptureConfig::load_from(args.config.as_deref())?;
    args.apply(&mut cfg)?;
    cfg.validate()?;

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    let mut dump = match &args.dump {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => None,
    };

    let session = Session::open(&cfg.device)?.negotiate(&cfg.format)?;
    let format = *session.format();
    if format.matches(&cfg.format) {
        log::info!("framegrab: format {}", format);
    } else {
        log::warn!(
            "framegrab: requested {}x{} {}, device selected {}",
            cfg.format.width,
            cfg.format.height,
            cfg.format.encoding,
            format
        );
    }

    let mut session = session.allocate_buffers(cfg.buffers)?;
    session.enqueue_all()?;
    let mut session = session.start_streaming()?;
    log::info!("framegrab: capturing, press Ctrl-C to stop");

    let mut dump_error: Option<std::io::Error> = None;
    let outcome = session.run(&cfg.loop_options(), &cancel, |data, _, _, _| {
        if dump_error.is_some() {
            return;
        }
        if let Some(out) = dump.as_mut() {
            if let Err(err) = out.write_all(data) {
                dump_error = Some(err);
                cancel.store(true, Ordering::SeqCst);
            }
        }
    });

    let stats = *session.stats();
    let teardown = session
        .stop_streaming()
        .and_then(|stopped| stopped.release())
        .and_then(|configured| configured.close());

    let exit = outcome?;
    teardown?;
    if let Some(err) = dump_error {
        return Err(anyhow!("failed to write frame dump: {}", err));
    }
    if let Some(mut out) = dump {
        out.flush().context("failed to flush frame dump")?;
    }

    match exit {
        LoopExit::Cancelled => log::info!("framegrab: interrupted"),
        LoopExit::FrameLimit => log::info!("framegrab: frame limit reached"),
    }
    log::info!(
        "framegrab: {} frames, {} timeouts, {} interrupted waits",
        stats.frames,
        stats.timeouts,
        stats.interruptions
    );
    Ok(())
}
