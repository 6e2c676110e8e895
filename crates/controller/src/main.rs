use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use framehook_core::{log_info, Direct3DVersion, ImageFormat, Rect, Size};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Api {
    Auto,
    #[value(name = "9")]
    D3D9,
    #[value(name = "10")]
    D3D10,
    #[value(name = "10.1")]
    D3D10_1,
    #[value(name = "11")]
    D3D11,
    #[value(name = "11.1")]
    D3D11_1,
}

impl From<Api> for Direct3DVersion {
    fn from(api: Api) -> Self {
        match api {
            Api::Auto => Direct3DVersion::AutoDetect,
            Api::D3D9 => Direct3DVersion::Direct3D9,
            Api::D3D10 => Direct3DVersion::Direct3D10,
            Api::D3D10_1 => Direct3DVersion::Direct3D10_1,
            Api::D3D11 => Direct3DVersion::Direct3D11,
            Api::D3D11_1 => Direct3DVersion::Direct3D11_1,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Png,
    Jpeg,
    Bmp,
}

impl From<Format> for ImageFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Png => ImageFormat::Png,
            Format::Jpeg => ImageFormat::Jpeg,
            Format::Bmp => ImageFormat::Bitmap,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "framehook")]
#[command(about = "Capture frames from and draw text into a running Direct3D 9/10/11 application")]
#[command(version)]
struct Cli {
    /// Target process id
    #[arg(long)]
    pid: u32,

    /// Path to framehook_agent.dll
    #[arg(long)]
    agent: PathBuf,

    /// Direct3D API to hook
    #[arg(long, value_enum, default_value = "auto")]
    api: Api,

    /// Write one frame to this file
    #[arg(long)]
    screenshot: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "png")]
    format: Format,

    /// Capture region as x,y,w,h
    #[arg(long, value_parser = parse_region)]
    region: Option<Rect>,

    /// Scale the capture to WxH
    #[arg(long, value_parser = parse_size)]
    resize: Option<Size>,

    /// Text shown in the game
    #[arg(long)]
    text: Option<String>,

    #[arg(long, default_value_t = 5000)]
    text_duration_ms: u64,

    /// Timeout for the agent handshake and for the screenshot
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Stay attached this long before disconnecting
    #[arg(long, default_value_t = 0)]
    hold_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FRAMEHOOK_LOG")]
    log_level: String,
}

fn parse_region(value: &str) -> Result<Rect, String> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let [x, y, w, h] = parts.as_slice() else {
        return Err(format!("expected x,y,w,h, got {:?}", value));
    };
    let number = |s: &str| s.parse::<i64>().map_err(|e| format!("{:?}: {}", s, e));
    let (x, y, w, h) = (number(x)?, number(y)?, number(w)?, number(h)?);
    if w < 0 || h < 0 {
        return Err("region size must not be negative".into());
    }
    Ok(Rect::new(x as i32, y as i32, w as u32, h as u32))
}

fn parse_size(value: &str) -> Result<Size, String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got {:?}", value))?;
    let w = w.trim().parse::<u32>().map_err(|e| e.to_string())?;
    let h = h.trim().parse::<u32>().map_err(|e| e.to_string())?;
    if w == 0 || h == 0 {
        return Err("resize dimensions must be positive".into());
    }
    Ok(Size::new(w, h))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = framehook_core::Config::new()?;
    let app_config = config.load().unwrap_or_default();
    framehook_core::logger::init_logger(config.log_dir.clone(), "controller", app_config.log_retention_count, false)?;
    log_info!("framehook v{} attaching to process {}", env!("CARGO_PKG_VERSION"), cli.pid);

    let result = run(&cli, app_config.capture);
    let _ = framehook_core::logger::finalize_logs();
    result
}

#[cfg(windows)]
fn run(cli: &Cli, mut capture: framehook_core::CaptureConfig) -> Result<()> {
    use framehook_controller::injector::RemoteThreadInjector;
    use framehook_controller::{desktop_host, SessionManager, SessionOptions, Target};
    use std::time::Duration;

    capture.direct3d_version = cli.api.into();
    capture.show_overlay |= cli.text.is_some();
    let timeout = Duration::from_millis(cli.timeout_ms);

    let manager = SessionManager::new(desktop_host(), SessionOptions::default());
    let target = Target {
        pid: cli.pid,
        agent_module: cli.agent.clone(),
    };
    let session = manager.attach(&target, capture, &RemoteThreadInjector::default())?;
    let interface = session.interface().clone();

    let outcome = (|| -> Result<()> {
        let version = interface
            .wait_connected(timeout)
            .ok_or_else(|| anyhow!("agent did not report hooks within {:?}", timeout))?;
        log_info!("Hooked {} in process {}", version, cli.pid);

        if let Some(text) = &cli.text {
            interface.display_in_game_text(text.clone(), Duration::from_millis(cli.text_duration_ms))?;
        }

        if let Some(path) = &cli.screenshot {
            let screenshot = interface
                .get_screenshot(cli.region, timeout, cli.resize, cli.format.into())
                .ok_or_else(|| anyhow!("no frame arrived within {:?}", timeout))?;
            std::fs::write(path, screenshot.bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            log_info!("Wrote {} ({} bytes)", path.display(), screenshot.bytes().len());
        }

        if cli.hold_ms > 0 {
            std::thread::sleep(Duration::from_millis(cli.hold_ms));
        }
        Ok(())
    })();

    session.dispose();
    outcome
}

#[cfg(not(windows))]
fn run(_cli: &Cli, _capture: framehook_core::CaptureConfig) -> Result<()> {
    bail!("attaching to a process is only supported on Windows")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_parses_four_numbers() {
        assert_eq!(parse_region("10, 20,640,480"), Ok(Rect::new(10, 20, 640, 480)));
        assert!(parse_region("10,20,640").is_err());
        assert!(parse_region("0,0,-1,5").is_err());
    }

    #[test]
    fn resize_needs_positive_dimensions() {
        assert_eq!(parse_size("1280x720"), Ok(Size::new(1280, 720)));
        assert!(parse_size("0x720").is_err());
        assert!(parse_size("1280").is_err());
    }

    #[test]
    fn cli_accepts_documented_flags() {
        let cli = Cli::try_parse_from([
            "framehook",
            "--pid",
            "4242",
            "--agent",
            "framehook_agent.dll",
            "--api",
            "11",
            "--screenshot",
            "frame.png",
            "--region",
            "0,0,100,50",
            "--resize",
            "50x25",
        ])
        .unwrap();
        assert_eq!(Direct3DVersion::from(cli.api), Direct3DVersion::Direct3D11);
        assert_eq!(cli.region, Some(Rect::new(0, 0, 100, 50)));
        assert_eq!(cli.resize, Some(Size::new(50, 25)));
        assert!(matches!(ImageFormat::from(cli.format), ImageFormat::Png));
    }
}
