use std::time::{Duration, Instant};

use axum::extract::ws::Message;

use super::{OutboundStage, ENCODER};

/// Payload bytes of a frame.
pub fn frame_len(msg: &Message) -> u64 {
    let n = match msg {
        Message::Text(s) => s.len(),
        Message::Binary(b) => b.len(),
        Message::Ping(v) => v.len(),
        Message::Pong(v) => v.len(),
        Message::Close(None) => 0,
        Message::Close(Some(cf)) => 2 + cf.reason.len(),
    };
    n as u64
}

/// Bytes a server-to-client frame puts on the wire: payload plus the
/// unmasked header (2, 4, or 10 bytes depending on payload length).
pub fn wire_len(msg: &Message) -> u64 {
    let payload = frame_len(msg);
    let header = match payload {
        0..=125 => 2,
        126..=65_535 => 4,
        _ => 10,
    };
    payload + header
}

#[derive(Debug)]
enum Slot {
    /// Named position with no behaviour of its own (e.g. the encoder).
    Marker(String),
    Shaper { name: String, stage: OutboundStage },
}

impl Slot {
    fn name(&self) -> &str {
        match self {
            Slot::Marker(name) => name,
            Slot::Shaper { name, .. } => name,
        }
    }
}

/// Result of pushing frames through the pipeline.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Frames that passed every stage, in order, ready for the socket.
    pub ready: Vec<Message>,
    /// Frames that a stage queued on this call.
    pub delayed: usize,
    /// Queue time of every frame a stage released on this call.
    pub waits: Vec<Duration>,
}

/// Ordered stages between the application and the socket.
///
/// Owned by exactly one connection context; not shared.
#[derive(Debug, Default)]
pub struct OutboundPipeline {
    slots: Vec<Slot>,
}

impl OutboundPipeline {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Pipeline whose first slot is the [`ENCODER`] marker.
    pub fn with_encoder() -> Self {
        Self {
            slots: vec![Slot::Marker(ENCODER.to_string())],
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name() == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut OutboundStage> {
        self.slots.iter_mut().find_map(|s| match s {
            Slot::Shaper { name: n, stage } if n == name => Some(stage),
            _ => None,
        })
    }

    /// Insert `stage` under `name`, replacing (detaching first) any slot with
    /// the same name. Frames flushed from a replaced stage are in the result.
    pub fn insert_stage(&mut self, name: &str, stage: OutboundStage, now: Instant) -> Delivery {
        let out = self.remove_stage(name, now).unwrap_or_default();
        let at = self.position(ENCODER).map(|i| i + 1).unwrap_or(0);
        self.slots.insert(
            at,
            Slot::Shaper {
                name: name.to_string(),
                stage,
            },
        );
        out
    }

    /// Detach `name`. Its queued frames continue, in order, through the
    /// stages that followed it. `None` when no such slot exists.
    pub fn remove_stage(&mut self, name: &str, now: Instant) -> Option<Delivery> {
        let idx = self.position(name)?;
        let pending = match self.slots.remove(idx) {
            Slot::Shaper { mut stage, .. } => stage.take_pending(),
            Slot::Marker(_) => Vec::new(),
        };
        let mut out = Delivery::default();
        for msg in pending {
            self.forward_from(idx, msg, now, &mut out);
        }
        Some(out)
    }

    /// Enter a frame at the head of the pipeline.
    pub fn write(&mut self, msg: Message, now: Instant) -> Delivery {
        let mut out = Delivery::default();
        self.forward_from(0, msg, now, &mut out);
        out
    }

    fn forward_from(&mut self, start: usize, msg: Message, now: Instant, out: &mut Delivery) {
        let len = wire_len(&msg);
        let mut msg = msg;
        for slot in self.slots.iter_mut().skip(start) {
            if let Slot::Shaper { stage, .. } = slot {
                match stage.submit(msg, len, now) {
                    Some(m) => msg = m,
                    None => {
                        out.delayed += 1;
                        return;
                    }
                }
            }
        }
        out.ready.push(msg);
    }

    /// Earliest window boundary among the shaping stages.
    pub fn next_tick(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Shaper { stage, .. } => Some(stage.next_tick()),
                Slot::Marker(_) => None,
            })
            .min()
    }

    /// Roll every stage whose boundary has passed and push released frames
    /// through the rest of the pipeline.
    pub fn tick(&mut self, now: Instant) -> Delivery {
        let mut out = Delivery::default();
        for idx in 0..self.slots.len() {
            let released = match &mut self.slots[idx] {
                Slot::Shaper { stage, .. } if now >= stage.next_tick() => stage.tick(now),
                _ => continue,
            };
            for r in released {
                out.waits.push(r.waited);
                self.forward_from(idx + 1, r.item, now, &mut out);
            }
        }
        out
    }

    /// Account inbound bytes on every stage; returns the longest suggested pause.
    pub fn record_read(&mut self, len: u64, now: Instant) -> Duration {
        self.slots
            .iter_mut()
            .filter_map(|s| match s {
                Slot::Shaper { stage, .. } => Some(stage.record_read(len, now)),
                Slot::Marker(_) => None,
            })
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
