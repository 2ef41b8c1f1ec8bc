use log::{debug, error, info};
use rosc::{encoder, OscMessage, OscPacket, OscType};
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

/// Sends a scripted control-message sequence over UDP, exercising the whole
/// pipeline without a live music environment. Loops forever.
pub struct Simulator {
    target: String,
    bpm: f32,
}

enum Step {
    Note {
        instrument: &'static str,
        note: &'static str,
        beats: f32,
    },
    /// A held note with no duration; ended by a later `Release`.
    Hold {
        instrument: &'static str,
        note: &'static str,
    },
    Release {
        instrument: &'static str,
        note: &'static str,
    },
    Drum {
        instrument: &'static str,
    },
    Layer {
        name: &'static str,
        beats: f32,
        variant: &'static str,
    },
    Sync {
        bpm: f32,
    },
    Wait {
        beats: f32,
    },
}

impl Simulator {
    pub fn new(target: String, bpm: f32) -> Self {
        Simulator { target, bpm }
    }

    /// Run the demo loop. Blocks the calling thread.
    pub fn run(&self) {
        let socket = match UdpSocket::bind("0.0.0.0:0") {
            Ok(s) => s,
            Err(e) => {
                error!("Simulator failed to bind UDP socket: {}", e);
                return;
            }
        };
        info!("Simulator → {}", self.target);

        let beat = Duration::from_secs_f32(60.0 / self.bpm);
        loop {
            for step in demo_sequence() {
                match step {
                    Step::Note {
                        instrument,
                        note,
                        beats,
                    } => self.send(
                        &socket,
                        "/play",
                        vec![
                            OscType::String(instrument.into()),
                            OscType::String(note.into()),
                            OscType::Float(beats),
                        ],
                    ),
                    Step::Hold { instrument, note } => self.send(
                        &socket,
                        "/play",
                        vec![
                            OscType::String(instrument.into()),
                            OscType::String(note.into()),
                        ],
                    ),
                    Step::Release { instrument, note } => self.send(
                        &socket,
                        "/stop",
                        vec![
                            OscType::String(instrument.into()),
                            OscType::String(note.into()),
                        ],
                    ),
                    Step::Drum { instrument } => {
                        self.send(&socket, "/drum", vec![OscType::String(instrument.into())])
                    }
                    Step::Layer {
                        name,
                        beats,
                        variant,
                    } => self.send(
                        &socket,
                        "/layer",
                        vec![
                            OscType::String(name.into()),
                            OscType::Float(beats),
                            OscType::String(variant.into()),
                        ],
                    ),
                    Step::Sync { bpm } => {
                        self.send(&socket, "/sync", vec![OscType::Float(bpm)])
                    }
                    Step::Wait { beats } => {
                        thread::sleep(beat.mul_f32(beats));
                    }
                }
            }
        }
    }

    fn send(&self, socket: &UdpSocket, addr: &str, args: Vec<OscType>) {
        let packet = OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args,
        });
        let bytes = match encoder::encode(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = socket.send_to(&bytes, &self.target) {
            debug!("Simulator send error: {}", e);
        }
    }
}

/// Four bars of material touching every message type: a chord loop with a
/// held bass on the keyboard, a basic drum pattern, and slow layers.
fn demo_sequence() -> Vec<Step> {
    let mut steps = Vec::new();

    steps.push(Step::Sync { bpm: 120.0 });
    steps.push(Step::Layer {
        name: "pads",
        beats: 16.0,
        variant: "warm",
    });

    let chords: [[&str; 3]; 4] = [
        ["a3", "c4", "e4"],
        ["f3", "a3", "c4"],
        ["c4", "e4", "g4"],
        ["g3", "b3", "d4"],
    ];
    let bass = ["a2", "f2", "c3", "g2"];

    for (bar, notes) in chords.iter().enumerate() {
        steps.push(Step::Layer {
            name: "arp",
            beats: 4.0,
            variant: if bar % 2 == 0 { "up" } else { "down" },
        });
        for note in notes {
            steps.push(Step::Note {
                instrument: "piano",
                note,
                beats: 3.5,
            });
        }
        steps.push(Step::Hold {
            instrument: "bass",
            note: bass[bar],
        });

        for beat in 0..4 {
            steps.push(Step::Drum {
                instrument: if beat % 2 == 0 { "kick" } else { "snare" },
            });
            if beat == 3 {
                steps.push(Step::Drum { instrument: "hat" });
            }
            steps.push(Step::Wait { beats: 1.0 });
        }
        steps.push(Step::Release {
            instrument: "bass",
            note: bass[bar],
        });
    }

    steps
}
