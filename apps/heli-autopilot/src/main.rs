//! 飞控进程主入口
//!
//! 读取 TOML 配置，打开舵机切换板和 GX3，运行遥测直到 Ctrl+C，
//! 然后通过驱动注册表统一关闭。

mod sink;

use anyhow::{Context, Result, bail};
use clap::Parser;
use heli_driver::{AppContext, AutopilotConfig};
use sink::TracingSink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 直升机飞控进程
#[derive(Parser, Debug)]
#[command(name = "heli-autopilot")]
#[command(about = "Helicopter flight computer: device drivers and telemetry", long_about = None)]
struct Args {
    /// 配置文件（TOML），缺省时使用内置默认值
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 只校验配置后退出
    #[arg(long)]
    check: bool,

    /// 打印默认配置后退出
    #[arg(long)]
    print_default_config: bool,

    /// 运行指定秒数后自动关闭
    #[arg(long)]
    run_for: Option<f64>,
}

fn load_config(path: Option<&Path>) -> Result<AutopilotConfig> {
    let Some(path) = path else {
        info!("No configuration file given, using defaults");
        return Ok(AutopilotConfig::default());
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: AutopilotConfig =
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("heli_autopilot=info,heli_driver=info")),
        )
        .init();

    let args = Args::parse();

    if args.print_default_config {
        print!("{}", toml::to_string_pretty(&AutopilotConfig::default())?);
        return Ok(());
    }

    let config = load_config(args.config.as_deref())?;
    if args.check {
        println!("configuration OK");
        return Ok(());
    }

    let deadline = match args.run_for {
        Some(secs) if secs.is_finite() && secs >= 0.0 => {
            Some(Instant::now() + Duration::from_secs_f64(secs))
        },
        Some(secs) => bail!("--run-for must be a non-negative number of seconds, got {}", secs),
        None => None,
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nReceived interrupt signal. Shutting down...");
            running.store(false, Ordering::Release);
        })
        .context("failed to set signal handler")?;
    }

    let ctx = AppContext::start(&config, TracingSink::default())?;
    info!(
        "servo switch {}, gx3 {}",
        if ctx.servo().is_enabled() { "enabled" } else { "disabled" },
        if ctx.imu().is_enabled() { "enabled" } else { "disabled" }
    );

    while running.load(Ordering::Acquire) && deadline.is_none_or(|d| Instant::now() < d) {
        std::thread::sleep(POLL_INTERVAL);
    }

    let report = ctx.shutdown();
    if !report.is_clean() {
        warn!("Drivers still running after shutdown: {:?}", report.still_running);
        bail!("unclean shutdown: {}", report.still_running.join(", "));
    }
    info!("Shutdown complete in {:?}", report.elapsed);
    Ok(())
}
