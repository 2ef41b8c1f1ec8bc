use crate::beat::Beats;
use crate::conductor::Conductor;
use crate::note::Note;
use log::{debug, info, warn};
use rosc::{OscMessage, OscPacket, OscType};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// UDP OSC listener driving a conductor. `run` blocks; the read timeout
/// keeps the loop responsive to the stop flag.
pub struct OscServer {
    socket: UdpSocket,
    conductor: Arc<Conductor>,
}

impl OscServer {
    pub fn bind(addr: &str, conductor: Arc<Conductor>) -> Result<Self, String> {
        let socket = UdpSocket::bind(addr)
            .map_err(|e| format!("Failed to bind OSC socket on {}: {}", addr, e))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(250)))
            .map_err(|e| format!("Failed to set OSC read timeout: {}", e))?;
        info!("OSC server listening on {}", addr);
        Ok(OscServer { socket, conductor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, String> {
        self.socket
            .local_addr()
            .map_err(|e| format!("No local OSC address: {}", e))
    }

    pub fn run(&self, stop: &AtomicBool) {
        let mut buf = [0u8; rosc::decoder::MTU];
        while !stop.load(Ordering::Relaxed) {
            let size = match self.socket.recv_from(&mut buf) {
                Ok((size, _)) => size,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!("OSC receive error: {}", e);
                    continue;
                }
            };
            match rosc::decoder::decode_udp(&buf[..size]) {
                Ok((_, packet)) => dispatch_packet(&self.conductor, packet),
                Err(e) => warn!("Dropping undecodable OSC packet: {}", e),
            }
        }
        info!("OSC server stopped");
    }
}

pub fn dispatch_packet(conductor: &Conductor, packet: OscPacket) {
    match packet {
        OscPacket::Message(msg) => dispatch(conductor, &msg),
        OscPacket::Bundle(bundle) => {
            for packet in bundle.content {
                dispatch_packet(conductor, packet);
            }
        }
    }
}

/// Route one decoded message. A malformed message is logged and dropped;
/// input problems never take the instrument down.
pub fn dispatch(conductor: &Conductor, msg: &OscMessage) {
    let result = match msg.addr.as_str() {
        "/play" => handle_play(conductor, msg),
        "/stop" => handle_stop(conductor, msg),
        "/drum" => handle_drum(conductor, msg),
        "/layer" => handle_layer(conductor, msg),
        "/sync" => handle_sync(conductor, msg),
        "/highlight" => handle_highlight(conductor, msg),
        "/grid" => handle_grid(conductor, msg),
        "/frozen" => {
            conductor.toggle_frozen();
            Ok(())
        }
        other => {
            debug!("Ignoring unknown OSC address {}", other);
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("Invalid {}: {}", msg.addr, e);
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

fn handle_play(conductor: &Conductor, msg: &OscMessage) -> Result<(), String> {
    check_args(msg, 2, 3)?;
    let instrument = name_arg(&msg.args[0]).map_err(|e| format!("instrument: {}", e))?;
    let note = note_arg(&msg.args[1]).map_err(|e| format!("note: {}", e))?;
    let duration = match msg.args.get(2) {
        Some(arg) => duration_arg(arg).map_err(|e| format!("duration: {}", e))?,
        None => Beats(0.0),
    };
    conductor.play_note(instrument, note, duration);
    Ok(())
}

fn handle_stop(conductor: &Conductor, msg: &OscMessage) -> Result<(), String> {
    check_args(msg, 2, 2)?;
    let instrument = name_arg(&msg.args[0]).map_err(|e| format!("instrument: {}", e))?;
    let note = note_arg(&msg.args[1]).map_err(|e| format!("note: {}", e))?;
    conductor.stop_note(instrument, note);
    Ok(())
}

fn handle_drum(conductor: &Conductor, msg: &OscMessage) -> Result<(), String> {
    check_args(msg, 1, 2)?;
    let instrument = name_arg(&msg.args[0]).map_err(|e| format!("instrument: {}", e))?;
    let duration = match msg.args.get(1) {
        Some(arg) => duration_arg(arg).map_err(|e| format!("duration: {}", e))?,
        None => Beats(0.0),
    };
    conductor.play_drum(instrument, duration);
    Ok(())
}

fn handle_layer(conductor: &Conductor, msg: &OscMessage) -> Result<(), String> {
    check_args(msg, 2, 3)?;
    let name = name_arg(&msg.args[0]).map_err(|e| format!("name: {}", e))?;
    let duration = duration_arg(&msg.args[1]).map_err(|e| format!("duration: {}", e))?;
    let variant = match msg.args.get(2) {
        Some(arg) => name_arg(arg).map_err(|e| format!("variant: {}", e))?,
        None => "",
    };
    conductor.play_layer(name, duration, variant);
    Ok(())
}

fn handle_sync(conductor: &Conductor, msg: &OscMessage) -> Result<(), String> {
    check_args(msg, 1, 1)?;
    let bpm = duration_arg(&msg.args[0]).map_err(|e| format!("bpm: {}", e))?;
    conductor.sync(bpm.beats());
    Ok(())
}

fn handle_highlight(conductor: &Conductor, msg: &OscMessage) -> Result<(), String> {
    let mut notes = Vec::with_capacity(msg.args.len());
    for (i, arg) in msg.args.iter().enumerate() {
        let note = note_arg(arg).map_err(|e| format!("note [{}]: {}", i, e))?;
        notes.push(note.pos());
    }
    conductor.set_highlight(notes);
    Ok(())
}

fn handle_grid(conductor: &Conductor, msg: &OscMessage) -> Result<(), String> {
    check_args(msg, 1, 1)?;
    let steps = number_arg(&msg.args[0]).map_err(|e| format!("steps: {}", e))?;
    if !(1..=64).contains(&steps) {
        return Err(format!("steps {} out of range", steps));
    }
    conductor.set_grid_steps(steps as u32);
    Ok(())
}

// ─── Argument coercion ──────────────────────────────────────────────────────

fn check_args(msg: &OscMessage, min: usize, max: usize) -> Result<(), String> {
    if msg.args.len() < min || msg.args.len() > max {
        return Err(format!(
            "expected {} to {} arguments, got {}",
            min,
            max,
            msg.args.len()
        ));
    }
    Ok(())
}

fn name_arg(arg: &OscType) -> Result<&str, String> {
    match arg {
        OscType::String(s) => Ok(s),
        other => Err(format!("not a string: {:?}", other)),
    }
}

fn note_arg(arg: &OscType) -> Result<Note, String> {
    name_arg(arg)?.parse()
}

fn number_arg(arg: &OscType) -> Result<i32, String> {
    match arg {
        OscType::Int(i) => Ok(*i),
        OscType::Long(l) => Ok(*l as i32),
        other => Err(format!("not an integer: {:?}", other)),
    }
}

/// Senders are sloppy about numeric types; accept any of them.
fn duration_arg(arg: &OscType) -> Result<Beats, String> {
    match arg {
        OscType::Float(f) => Ok(Beats(*f)),
        OscType::Double(d) => Ok(Beats(*d as f32)),
        OscType::Int(i) => Ok(Beats(*i as f32)),
        OscType::Long(l) => Ok(Beats(*l as f32)),
        other => Err(format!("not a number: {:?}", other)),
    }
}
