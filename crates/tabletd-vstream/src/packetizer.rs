//! Event packetization
//!
//! Events are delivered to consumers in batches. Groups of events that must
//! not be split (a FIELD with its first ROW, a GTID with its DDL) are added
//! together; the packetizer flushes on the packet-size target, delivers
//! oversized groups as their own batch, isolates DDL batches, and sends
//! heartbeats immediately.

use crate::vevent::VEvent;

/// Accumulates events into consumer batches.
pub struct Packetizer {
    packet_size: usize,
    buffer: Vec<VEvent>,
    buffered_bytes: usize,
}

impl Packetizer {
    pub fn new(packet_size: usize) -> Self {
        Self {
            packet_size: packet_size.max(1),
            buffer: Vec::new(),
            buffered_bytes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Add an unsplittable group. Completed batches are appended to `out`.
    pub fn add_group(&mut self, events: Vec<VEvent>, out: &mut Vec<Vec<VEvent>>) {
        if events.is_empty() {
            return;
        }

        // Heartbeats and DDL go out by themselves, ahead of nothing: flush
        // whatever is pending first so ordering is preserved.
        let standalone = events.iter().any(|e| e.is_heartbeat() || e.is_ddl());
        if standalone {
            self.flush(out);
            out.push(events);
            return;
        }

        let group_bytes: usize = events.iter().map(VEvent::byte_size).sum();
        if self.buffered_bytes > 0 && self.buffered_bytes + group_bytes > self.packet_size {
            self.flush(out);
        }
        self.buffer.extend(events);
        self.buffered_bytes += group_bytes;
        // A single group larger than the target is delivered as its own
        // batch rather than split.
        if self.buffered_bytes >= self.packet_size {
            self.flush(out);
        }
    }

    /// Flush any buffered events as one batch.
    pub fn flush(&mut self, out: &mut Vec<Vec<VEvent>>) {
        if !self.buffer.is_empty() {
            out.push(std::mem::take(&mut self.buffer));
            self.buffered_bytes = 0;
        }
    }
}
