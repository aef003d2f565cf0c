use std::io::BufRead;

use clap::{Parser, ValueEnum};
use modeset::{
    backend::{
        allocator::{Backend, Tiling},
        drm::DrmDeviceFd,
    },
    output::{
        config::{
            mode_1024x768, BufferCount, ProvisionConfig, CURSOR_SIZE, DEFAULT_DRM_DEVICE, DEFAULT_TARGET_WIDTH,
        },
        ResourceManager,
    },
    utils::DeviceFd,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Light up every connected output and wait for enter", long_about = None)]
struct Cli {
    /// Drm device node to use
    #[arg(short, long, default_value = DEFAULT_DRM_DEVICE)]
    device: String,
    /// Number of scanout buffers per output
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=3))]
    buffers: u8,
    /// Memory layout of the scanout buffers, tiled layouts are allocated through gbm
    #[arg(short, long, default_value = "linear")]
    tiling: TilingArg,
    /// Horizontal resolution to look for in the modes of each output
    #[arg(long, default_value_t = DEFAULT_TARGET_WIDTH)]
    target_width: u16,
    /// Use a handmade 1024x768@60 mode on every output
    #[arg(long)]
    force_mode: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum TilingArg {
    #[value(name = "linear")]
    Linear,
    #[value(name = "x")]
    X,
    #[value(name = "y")]
    Y,
}

impl From<TilingArg> for Tiling {
    fn from(arg: TilingArg) -> Tiling {
        match arg {
            TilingArg::Linear => Tiling::Linear,
            TilingArg::X => Tiling::X,
            TilingArg::Y => Tiling::Y,
        }
    }
}

fn main() {
    let args = Cli::parse();

    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    let fd = match DeviceFd::open(&args.device) {
        Ok(fd) => fd,
        Err(err) => {
            error!("Failed to open {}: {}", args.device, err);
            std::process::exit(1);
        }
    };
    let device = DrmDeviceFd::new(fd);
    if !device.is_privileged() {
        warn!("Not drm master, setting modes may fail while another client drives the device");
    }

    let backend = match Tiling::from(args.tiling) {
        Tiling::Linear => Backend::dumb(device.clone()),
        tiling => match Backend::gbm(device.clone(), tiling) {
            Ok(backend) => backend,
            Err(err) => {
                error!("Failed to set up gbm: {}", err);
                std::process::exit(1);
            }
        },
    };

    let buffers = BufferCount::try_from(usize::from(args.buffers)).expect("clap checks the range");
    let mut config = ProvisionConfig::default()
        .with_buffers(buffers)
        .with_target_width(args.target_width);
    if args.force_mode {
        config = config.with_forced_mode(mode_1024x768());
    }

    let mut manager = ResourceManager::new(device, backend, config);
    if let Err(err) = manager.provision_all() {
        error!("Failed to provision outputs: {}", err);
        std::process::exit(1);
    }
    for (connector, err) in manager.skipped() {
        warn!(?connector, "not used: {}", err);
    }

    let device = manager.device().clone();
    for output in manager.displays_mut() {
        let (width, height) = output.mode().size();
        let (connector, crtc, enabled) = (output.connector(), output.crtc(), output.is_enabled());
        info!(
            ?connector,
            interface = ?output.interface(),
            ?crtc,
            enabled,
            "{}x{}@{} with {} buffers",
            width,
            height,
            output.mode().vrefresh(),
            output.buffers().len(),
        );

        for (idx, buffer) in output.buffers_mut().iter_mut().enumerate() {
            let color = PALETTE[idx % PALETTE.len()];
            if let Some(stride) = buffer.map_stride() {
                if let Some(data) = buffer.data_mut() {
                    draw_gradient(data, stride as usize, color);
                }
            }
        }
        if let Err(err) = output.flush_front(&device) {
            warn!(?connector, "{}", err);
        }

        if let Some(data) = output.cursor_mut().data_mut() {
            draw_cursor(data);
        }
        if enabled {
            if let Err(err) = output.show_cursor(&device, (i32::from(width) / 2, i32::from(height) / 2)) {
                warn!(?connector, "{}", err);
            }
        }
    }

    info!("Press enter to restore the previous configuration");
    let _ = std::io::stdin().lock().lines().next();

    manager.teardown();
}

const PALETTE: [[u8; 3]; 3] = [[0xff, 0x40, 0x40], [0x40, 0xff, 0x40], [0x40, 0x40, 0xff]];

/// Fill a linear xrgb8888 buffer with a vertical gradient of `color`
fn draw_gradient(data: &mut [u8], stride: usize, color: [u8; 3]) {
    if stride == 0 {
        return;
    }
    let rows = data.len() / stride;
    for (y, row) in data.chunks_exact_mut(stride).enumerate() {
        let scale = (y * 255 / rows.max(1)) as u16;
        for pixel in row.chunks_exact_mut(4) {
            pixel[0] = (u16::from(color[2]) * scale / 255) as u8;
            pixel[1] = (u16::from(color[1]) * scale / 255) as u8;
            pixel[2] = (u16::from(color[0]) * scale / 255) as u8;
            pixel[3] = 0;
        }
    }
}

/// Draw an opaque white square with a black border into a 64x64 argb cursor
fn draw_cursor(data: &mut [u8]) {
    let size = CURSOR_SIZE as usize;
    for (idx, pixel) in data.chunks_exact_mut(4).enumerate() {
        let (x, y) = (idx % size, idx / size);
        let border = x < 2 || y < 2 || x >= size - 2 || y >= size - 2;
        let value = if border { 0x00 } else { 0xff };
        pixel.copy_from_slice(&[value, value, value, 0xff]);
    }
}
