//! The RTP/RTCP send loop shared by every track.
//!
//! A [`Packetizer`] owns one track of one connection: its payloader, its
//! [`RtpSink`], a fixed SSRC and the running sequence number. Playback runs
//! on a dedicated thread so a slow client never blocks the dispatcher.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use super::rtcp::{SENDER_REPORT_INTERVAL, sender_report};
use super::rtp::{HEADER_LEN, PAYLOAD_TYPE, RtpHeader, scale_timestamp};
use super::{EncodedUnit, StreamKind, ntp_timestamp, timestamp_us};
use crate::error::{Result, StreamError};
use crate::session::StreamState;
use crate::session::queue::{BoundedQueue, Popped};
use crate::transport::RtpSink;

/// Bounded wait for the send thread in [`Packetizer::stop`].
pub const STOP_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(10);

/// Key frame requests are sent while fewer than this many units went out.
const VIDEO_SYNC_UNITS: u32 = 15;
const VIDEO_SYNC_EVERY: u32 = 5;

/// Codec-specific conversion of one access unit into RTP packets.
pub trait Payloader: Send + 'static {
    /// Media kind this payloader produces; selects the input queue.
    const KIND: StreamKind;

    /// Packetize one access unit. Each returned `Vec<u8>` is a complete RTP
    /// packet, header included, no larger than `max_packet_size`.
    ///
    /// The header's timestamp is already set for this unit. An empty result
    /// means the unit was dropped on purpose.
    fn packetize(
        &mut self,
        rtp: &mut RtpHeader,
        unit: &[u8],
        max_packet_size: usize,
    ) -> Result<Vec<Vec<u8>>>;
}

struct Running {
    handle: JoinHandle<()>,
    stop_tx: Sender<()>,
}

/// One track's packetizer.
///
/// Built at SETUP time, started by PLAY, stopped by TEARDOWN or when the
/// connection closes.
pub struct Packetizer<P: Payloader> {
    state: Arc<StreamState>,
    clock_rate: u32,
    ssrc: u32,
    sequence: u16,
    local_ports: Option<(u16, u16)>,
    pending: Option<(P, Box<dyn RtpSink>)>,
    running: Option<Running>,
}

impl<P: Payloader> Packetizer<P> {
    pub fn new(
        payloader: P,
        sink: Box<dyn RtpSink>,
        state: Arc<StreamState>,
        clock_rate: u32,
        sequence: u16,
    ) -> Self {
        Self {
            state,
            clock_rate,
            ssrc: rand::random(),
            sequence,
            local_ports: sink.local_ports(),
            pending: Some((payloader, sink)),
            running: None,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Local (RTP, RTCP) ports of a UDP sink.
    pub fn local_ports(&self) -> Option<(u16, u16)> {
        self.local_ports
    }

    /// Whether the send thread is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawn the send thread. A packetizer runs at most once.
    pub fn start(&mut self) -> Result<()> {
        let (payloader, sink) = self.pending.take().ok_or(StreamError::AlreadyStarted)?;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let worker = SendLoop {
            payloader,
            sink,
            state: self.state.clone(),
            clock_rate: self.clock_rate,
            rtp: RtpHeader::new(PAYLOAD_TYPE, self.ssrc, self.sequence),
            stop_rx,
        };
        let handle = thread::Builder::new()
            .name(format!("rtp-{}", P::KIND))
            .spawn(move || worker.run())?;
        self.running = Some(Running { handle, stop_tx });
        Ok(())
    }

    /// Ask the send thread to exit and wait up to [`STOP_TIMEOUT`].
    ///
    /// A thread stuck in a blocking write is left behind; it ends on its
    /// own once the transport unblocks or fails.
    pub fn stop(&mut self) {
        let Some(Running { handle, stop_tx }) = self.running.take() else {
            return;
        };
        drop(stop_tx);

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(STOP_POLL);
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::error!(kind = %P::KIND, "packetizer thread panicked");
            }
        } else {
            tracing::warn!(kind = %P::KIND, ssrc = self.ssrc, "cannot stop the packetizer now, abandoning it");
        }
    }
}

impl<P: Payloader> Drop for Packetizer<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SendLoop<P: Payloader> {
    payloader: P,
    sink: Box<dyn RtpSink>,
    state: Arc<StreamState>,
    clock_rate: u32,
    rtp: RtpHeader,
    stop_rx: Receiver<()>,
}

impl<P: Payloader> SendLoop<P> {
    fn run(mut self) {
        let state = self.state.clone();
        let Some(queue) = state.encoded_queue(P::KIND) else {
            tracing::error!(kind = %P::KIND, "no encoded queue for this media kind");
            return;
        };
        queue.clear();
        let guard = state.begin_stream(P::KIND);
        tracing::debug!(kind = %P::KIND, id = guard.id(), ssrc = self.rtp.ssrc, "packetizer started");
        self.stream(queue);
        tracing::debug!(kind = %P::KIND, id = guard.id(), "packetizer stopped");
    }

    fn stream(&mut self, queue: &BoundedQueue<EncodedUnit>) {
        let max = self.sink.max_packet_size();
        let mut last_report: Option<Instant> = None;
        let mut packets: u32 = 0;
        let mut octets: u32 = 0;
        let mut units: u32 = 0;

        loop {
            if last_report.is_none_or(|t| t.elapsed() >= SENDER_REPORT_INTERVAL) {
                last_report = Some(Instant::now());
                let sr = sender_report(
                    self.rtp.ssrc,
                    ntp_timestamp(),
                    scale_timestamp(timestamp_us(), self.clock_rate),
                    packets,
                    octets,
                );
                if let Err(e) = self.sink.send_rtcp(&sr) {
                    tracing::debug!(kind = %P::KIND, error = %e, "RTCP send failed");
                    return;
                }
                tracing::trace!(kind = %P::KIND, packets, octets, "sender report");
            }

            if P::KIND == StreamKind::H264
                && units < VIDEO_SYNC_UNITS
                && units % VIDEO_SYNC_EVERY == 0
            {
                self.state.request_control("video-sync", "send");
            }

            let unit = match queue.pop_or_cancel(&self.stop_rx) {
                Popped::Item(unit) => unit,
                Popped::Empty => {
                    tracing::debug!(kind = %P::KIND, "input starved, ending stream");
                    return;
                }
                Popped::Cancelled => return,
            };

            self.rtp
                .set_timestamp(scale_timestamp(unit.timestamp_us, self.clock_rate));
            let out = match self.payloader.packetize(&mut self.rtp, &unit.data, max) {
                Ok(out) => out,
                Err(e) => {
                    tracing::error!(kind = %P::KIND, error = %e, "packetizer aborted");
                    return;
                }
            };
            if out.is_empty() {
                continue;
            }

            for packet in &out {
                if let Err(e) = self.sink.send_rtp(packet) {
                    tracing::debug!(kind = %P::KIND, error = %e, "RTP send failed");
                    return;
                }
                packets = packets.wrapping_add(1);
                octets = octets.wrapping_add((packet.len() - HEADER_LEN) as u32);
            }
            units = units.saturating_add(1);
            tracing::trace!(kind = %P::KIND, rtp_packets = out.len(), seq = self.rtp.sequence(), "unit sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventHub, ServerEvent};
    use crate::media::aac::AacPayloader;
    use crate::media::h264::H264Payloader;
    use crate::media::{AudioBuffer, VideoBuffer};
    use crate::session::queue::QueueConfig;
    use parking_lot::Mutex;
    use std::io;

    #[derive(Clone, Default)]
    struct Recorder {
        rtp: Arc<Mutex<Vec<Vec<u8>>>>,
        rtcp: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    struct MemorySink {
        max: usize,
        rec: Recorder,
    }

    impl RtpSink for MemorySink {
        fn max_packet_size(&self) -> usize {
            self.max
        }
        fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()> {
            self.rec.rtp.lock().push(packet.to_vec());
            Ok(())
        }
        fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()> {
            self.rec.rtcp.lock().push(packet.to_vec());
            Ok(())
        }
    }

    fn state(pop_timeout: Duration) -> (Arc<StreamState>, Arc<EventHub>) {
        let hub = Arc::new(EventHub::new());
        let config = QueueConfig {
            pop_timeout,
            ..QueueConfig::default()
        };
        (Arc::new(StreamState::new(config, hub.clone())), hub)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn seq(p: &[u8]) -> u16 {
        u16::from_be_bytes([p[2], p[3]])
    }

    #[test]
    fn video_packets_are_gated_and_sequenced() {
        let (state, hub) = state(Duration::from_secs(5));
        let events = hub.subscribe();
        let rec = Recorder::default();
        let sink = MemorySink { max: 1400, rec: rec.clone() };
        let mut p = Packetizer::new(H264Payloader::new(), Box::new(sink), state.clone(), 90_000, 65530);
        p.start().unwrap();
        assert!(wait_until(|| state.is_streaming(StreamKind::H264)));

        let non_idr = [0u8, 0, 0, 1, 0x41, 9, 9, 9];
        for _ in 0..3 {
            state.push_video(&VideoBuffer::unit(&non_idr, 1000));
        }
        let mut idr = vec![0u8, 0, 0, 1, 0x65];
        idr.resize(4 + 3000, 0x55);
        state.push_video(&VideoBuffer::unit(&idr, 2000));
        state.push_video(&VideoBuffer::unit(&non_idr, 3000));

        // 3000-byte IDR -> 3 fragments, then one single-NAL packet
        assert!(wait_until(|| rec.rtp.lock().len() == 4));
        p.stop();

        let packets = rec.rtp.lock().clone();
        assert_eq!(packets[0][12] & 0x1F, 28, "first packet is the IDR's first fragment");
        let seqs: Vec<u16> = packets.iter().map(|p| seq(p)).collect();
        assert_eq!(seqs, vec![65530, 65531, 65532, 65533]);
        assert!(!rec.rtcp.lock().is_empty(), "a sender report goes out first");

        let received: Vec<ServerEvent> = events.try_iter().collect();
        assert!(received.iter().any(|e| matches!(e, ServerEvent::ControlRequest { action, .. } if action == "video-sync")));
        let stopped = received
            .iter()
            .filter(|e| matches!(e, ServerEvent::StreamStopped { kind: StreamKind::H264, .. }))
            .count();
        assert_eq!(stopped, 1);
        assert!(!state.is_streaming(StreamKind::H264));
    }

    #[test]
    fn oversized_audio_unit_ends_the_packetizer() {
        let (state, hub) = state(Duration::from_secs(5));
        let events = hub.subscribe();
        let rec = Recorder::default();
        let sink = MemorySink { max: 1400, rec: rec.clone() };
        let mut p = Packetizer::new(AacPayloader::new(), Box::new(sink), state.clone(), 44_100, 0);
        p.start().unwrap();
        assert!(wait_until(|| state.is_streaming(StreamKind::Aac)));

        state.push_audio(&AudioBuffer::unit(&[0x21; 2000], 0));
        assert!(wait_until(|| !p.is_running()));
        assert!(rec.rtp.lock().is_empty());

        assert!(!state.push_audio(&AudioBuffer::unit(&[0x21; 10], 0)));
        p.stop();
        let stopped = events
            .try_iter()
            .filter(|e| matches!(e, ServerEvent::StreamStopped { kind: StreamKind::Aac, .. }))
            .count();
        assert_eq!(stopped, 1);
    }

    #[test]
    fn starved_queue_ends_the_stream() {
        let (state, _hub) = state(Duration::from_millis(50));
        let sink = MemorySink { max: 1400, rec: Recorder::default() };
        let mut p = Packetizer::new(AacPayloader::new(), Box::new(sink), state.clone(), 8000, 0);
        p.start().unwrap();
        assert!(wait_until(|| !p.is_running()));
        assert!(!state.is_streaming(StreamKind::Aac));
    }

    #[test]
    fn start_twice_is_rejected() {
        let (state, _hub) = state(Duration::from_secs(5));
        let sink = MemorySink { max: 1400, rec: Recorder::default() };
        let mut p = Packetizer::new(AacPayloader::new(), Box::new(sink), state, 8000, 0);
        p.start().unwrap();
        assert!(matches!(p.start(), Err(StreamError::AlreadyStarted)));
        let start = Instant::now();
        p.stop();
        assert!(start.elapsed() < STOP_TIMEOUT);
        assert!(!p.is_running());
    }
}
