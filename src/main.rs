use pulsetrail::conductor::{spawn_janitor, Conductor};
use pulsetrail::console_display::ConsoleDisplay;
use pulsetrail::osc_server::OscServer;
use pulsetrail::simulator::Simulator;
use pulsetrail::ws_server::WsServer;

use clap::Parser;
use crossbeam_channel::{bounded, tick, Sender};
use log::{error, info};
use pulsetrail::artifact::Artifact;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pulsetrail")]
#[command(about = "OSC-driven scrolling piano-roll visualizer")]
struct Cli {
    /// UDP IP:port to listen on for OSC messages
    #[arg(long, default_value = "127.0.0.1:8765")]
    osc_addr: String,

    /// Initial tempo in beats per minute
    #[arg(long, default_value_t = 120.0)]
    bpm: f32,

    /// Enable the WebSocket server for browser display
    #[arg(long)]
    ws: bool,

    /// WebSocket server bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    ws_addr: String,

    /// Frame render rate (Hz)
    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Enable the terminal display (for headless/debug)
    #[arg(long)]
    console: bool,

    /// Terminal display refresh rate (Hz)
    #[arg(long, default_value_t = 20)]
    display_hz: u32,

    /// Send a scripted demo sequence to our own OSC port
    #[arg(long)]
    simulate: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
    let cli = Cli::parse();

    let conductor = Arc::new(Conductor::new(cli.bpm));
    let _janitor = spawn_janitor(&conductor, Duration::from_secs(5));

    // OSC ingestion
    let server = match OscServer::bind(&cli.osc_addr, conductor.clone()) {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        thread::Builder::new()
            .name("osc-server".into())
            .spawn(move || server.run(&stop))
            .expect("failed to spawn OSC server thread");
    }

    if cli.simulate {
        let target = cli.osc_addr.clone();
        let bpm = cli.bpm;
        thread::Builder::new()
            .name("simulator".into())
            .spawn(move || Simulator::new(target, bpm).run())
            .expect("failed to spawn simulator thread");
    }

    // Frame consumers
    let mut frame_txs: Vec<Sender<Arc<Artifact>>> = Vec::new();

    if cli.ws {
        let (tx, rx) = bounded::<Arc<Artifact>>(2);
        frame_txs.push(tx);
        let ws = WsServer::new(rx, cli.ws_addr.clone());
        thread::Builder::new()
            .name("ws-server".into())
            .spawn(move || ws.run())
            .expect("failed to spawn WebSocket server thread");
    }

    if cli.console {
        let (tx, rx) = bounded::<Arc<Artifact>>(2);
        frame_txs.push(tx);
        let display = ConsoleDisplay::new(rx, cli.display_hz);
        thread::Builder::new()
            .name("console-display".into())
            .spawn(move || display.run())
            .expect("failed to spawn console display thread");
    }

    if frame_txs.is_empty() {
        info!("No display enabled (use --ws and/or --console); serving OSC only");
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }

    // Render loop: one frame per tick, fanned out to all consumers. A full
    // consumer drops frames rather than stalling rendering.
    info!("Rendering at {} fps", cli.fps);
    let ticker = tick(Duration::from_micros(1_000_000 / cli.fps.max(1) as u64));
    for _ in ticker.iter() {
        let frame = Arc::new(conductor.render_frame());
        for tx in &frame_txs {
            let _ = tx.try_send(frame.clone());
        }
    }
}
