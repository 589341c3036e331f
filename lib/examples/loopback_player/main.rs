//! Plays a generated test pattern through the loopback compositor, and
//! reports how buffers went back and forth.
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{App, Arg};
use wlsink::compositor::loopback::{LoopbackCompositor, ReleasePolicy};
use wlsink::pool::{AcquireError, PoolConfig, PresentError};
use wlsink::sink::{Frame, SinkConfig, SinkError, VideoSink};
use wlsink::PixelFormat;
use wlsink_utils::framegen::FrameGenerator;

fn parse_size(s: &str) -> Result<(u32, u32)> {
    let (width, height) = s
        .split_once('x')
        .ok_or_else(|| anyhow!("Invalid frame size {}", s))?;
    Ok((width.parse()?, height.parse()?))
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("Loopback video sink player")
        .arg(
            Arg::with_name("num_frames")
                .long("stop_after")
                .takes_value(true)
                .help("Stop after rendering a given number of frames"),
        )
        .arg(
            Arg::with_name("frame_size")
                .long("frame_size")
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the frames to render (e.g. \"640x480\")"),
        )
        .arg(
            Arg::with_name("format")
                .long("format")
                .takes_value(true)
                .default_value("BGRA")
                .help("Fourcc of the frames to render (BGRA, BGRx, NV12 or I420)"),
        )
        .arg(
            Arg::with_name("backing")
                .long("backing")
                .takes_value(true)
                .possible_values(["shm", "dmabuf"])
                .default_value("dmabuf")
                .help("Preferred kind of buffers"),
        )
        .arg(
            Arg::with_name("release")
                .long("release")
                .takes_value(true)
                .possible_values(["replace", "immediate"])
                .default_value("replace")
                .help("When the compositor releases buffers"),
        )
        .arg(
            Arg::with_name("copy")
                .long("copy")
                .help("Render frames from memory not owned by the sink"),
        )
        .arg(
            Arg::with_name("pool_size")
                .long("pool_size")
                .takes_value(true)
                .default_value("3")
                .help("Number of buffers in the pool"),
        )
        .get_matches();

    let stop_after = matches
        .value_of("num_frames")
        .map(|n| n.parse::<usize>())
        .transpose()
        .context("Invalid value for stop_after")?;
    let (width, height) = parse_size(matches.value_of("frame_size").unwrap_or("640x480"))?;
    let fourcc: [u8; 4] = matches
        .value_of("format")
        .unwrap_or("BGRA")
        .as_bytes()
        .try_into()
        .context("Format must be 4 characters long")?;
    let format = PixelFormat::from(&fourcc);
    let pool_size = matches
        .value_of("pool_size")
        .unwrap_or("3")
        .parse::<usize>()
        .context("Invalid pool size")?;
    let copy = matches.is_present("copy");

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl-C handler")?;
    }

    let compositor = Arc::new(LoopbackCompositor::new()?);
    compositor.set_release_policy(match matches.value_of("release") {
        Some("immediate") => ReleasePolicy::Immediate,
        _ => ReleasePolicy::OnReplace,
    });
    let surface = compositor.create_surface();

    let config = SinkConfig::new()
        .pool_size(pool_size)
        .prefer_dmabuf(matches.value_of("backing") == Some("dmabuf"));
    let sink = VideoSink::new(compositor.clone(), surface, config)?;
    sink.configure(PoolConfig::new(format, width, height))?;
    println!(
        "Rendering {}x{} {} frames with {} buffers",
        width,
        height,
        format,
        sink.backing()
    );

    let mut frame_gen = FrameGenerator::new(format, width, height)?;
    let start_time = Instant::now();
    let mut frame_counter = 0usize;

    while !lets_quit.load(Ordering::SeqCst) {
        if stop_after.map(|max| frame_counter >= max).unwrap_or(false) {
            break;
        }

        let buffer = if copy {
            let frame = frame_gen.next_frame();
            sink.render(Frame::Foreign(frame.as_foreign()))
        } else {
            match sink.acquire() {
                Ok(mut handle) => {
                    frame_gen.fill_buffer(&mut handle)?;
                    sink.render(Frame::Pooled(handle))
                }
                Err(e) => Err(e),
            }
        };

        let buffer = match buffer {
            Ok(buffer) => buffer,
            Err(SinkError::Acquire(AcquireError::Exhausted))
            | Err(SinkError::Present(PresentError::Acquire(AcquireError::Exhausted))) => {
                // Wait for the compositor to give a buffer back.
                if !sink.wait_for_free(Duration::from_secs(1))? {
                    return Err(anyhow!("Compositor did not release any buffer"));
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        frame_counter += 1;
        let fps = frame_counter as f32 / start_time.elapsed().as_millis().max(1) as f32 * 1000.0;
        print!(
            "\rRendered frame {:#6} with {}, outstanding: {} fps: {:#8.2}",
            frame_counter,
            buffer,
            sink.outstanding_buffers(),
            fps,
        );
        io::stdout().flush()?;
    }

    // Insert new line since we were overwriting the same one
    println!();

    let report = sink.stop();
    println!(
        "Teardown took {} round trips ({} timed out), {} buffers freed without release",
        report.rounds, report.timeouts, report.forced
    );

    Ok(())
}
