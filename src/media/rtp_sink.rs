//! RTP sink base (C8): packet/octet counters, SSRC/timestamp bookkeeping,
//! and per-receiver transmission statistics fed by incoming RTCP RR
//! packets, grounded in `RTPSink.hh`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::media::rtp::RtpHeader;
use crate::rtcp::ReceiverReport;

/// Per-receiver stats derived from RTCP receiver reports, mirroring
/// `RTPTransmissionStats`. Only the fields this server can itself derive or
/// receive over RTCP are kept; live555's `jitter`/`roundTripDelay` fields
/// that require NTP-synchronized sender-report timestamps are approximated
/// using local receipt times (see `SPEC_FULL.md` §0.5).
#[derive(Debug, Clone)]
pub struct RtpTransmissionStats {
    pub ssrc: u32,
    pub last_packet_num_received: u32,
    pub first_packet_num_reported: u32,
    pub total_num_packets_lost: u64,
    pub jitter: u32,
    pub packet_loss_ratio: f32,
    pub time_created: Instant,
    pub last_time_received: Instant,
}

impl RtpTransmissionStats {
    fn from_report(report: &ReceiverReport, now: Instant) -> Self {
        RtpTransmissionStats {
            ssrc: report.ssrc,
            last_packet_num_received: report.extended_highest_sequence,
            first_packet_num_reported: report.extended_highest_sequence,
            total_num_packets_lost: report.cumulative_packets_lost.max(0) as u64,
            jitter: report.interarrival_jitter,
            packet_loss_ratio: report.fraction_lost as f32 / 256.0,
            time_created: now,
            last_time_received: now,
        }
    }

    fn update(&mut self, report: &ReceiverReport, now: Instant) {
        self.packet_loss_ratio = report.fraction_lost as f32 / 256.0;
        self.last_packet_num_received = report.extended_highest_sequence;
        self.total_num_packets_lost = report.cumulative_packets_lost.max(0) as u64;
        self.jitter = report.interarrival_jitter;
        self.last_time_received = now;
    }
}

/// Tracks one [`RtpTransmissionStats`] per reporting receiver's SSRC,
/// mirroring `RTPTransmissionStatsDB`.
#[derive(Debug, Default)]
pub struct RtpTransmissionStatsDb {
    by_ssrc: HashMap<u32, RtpTransmissionStats>,
}

impl RtpTransmissionStatsDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_receivers(&self) -> usize {
        self.by_ssrc.len()
    }

    pub fn lookup(&self, ssrc: u32) -> Option<&RtpTransmissionStats> {
        self.by_ssrc.get(&ssrc)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RtpTransmissionStats> {
        self.by_ssrc.values()
    }

    /// Folds in a freshly decoded receiver report.
    pub fn note_incoming_rr(&mut self, report: &ReceiverReport, now: Instant) {
        self.by_ssrc
            .entry(report.ssrc)
            .and_modify(|s| s.update(report, now))
            .or_insert_with(|| RtpTransmissionStats::from_report(report, now));
    }

    pub fn remove_record(&mut self, ssrc: u32) {
        self.by_ssrc.remove(&ssrc);
    }
}

/// Bookkeeping common to every RTP sink: sequence/timestamp state
/// ([`RtpHeader`]), packet/octet counters, and the receiver-stats
/// database fed by RTCP RR. Codec-specific sinks (`media/h264.rs`,
/// `media/h265.rs`) compose this rather than re-deriving it.
pub struct RtpSinkCore {
    header: RtpHeader,
    clock_rate: u32,
    packet_count: u64,
    octet_count: u64,
    total_octet_count: u64,
    creation_time: Instant,
    transmission_stats: RtpTransmissionStatsDb,
}

impl RtpSinkCore {
    pub fn new(payload_type: u8, clock_rate: u32) -> Self {
        RtpSinkCore {
            header: RtpHeader::with_random_ssrc(payload_type),
            clock_rate,
            packet_count: 0,
            octet_count: 0,
            total_octet_count: 0,
            creation_time: Instant::now(),
            transmission_stats: RtpTransmissionStatsDb::new(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    pub fn rtp_payload_type(&self) -> u8 {
        self.header.pt
    }

    pub fn rtp_timestamp_frequency(&self) -> u32 {
        self.clock_rate
    }

    pub fn current_seq_no(&self) -> u16 {
        self.header.sequence()
    }

    pub fn current_timestamp(&self) -> u32 {
        self.header.timestamp() as u32
    }

    pub fn preset_next_timestamp(&mut self, timestamp: u32) {
        self.header.set_timestamp(timestamp as u64);
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn octet_count(&self) -> u64 {
        self.octet_count
    }

    pub fn total_octet_count(&self) -> u64 {
        self.total_octet_count
    }

    /// Serializes one RTP packet header and records it in the running
    /// counters. `payload_len` excludes the 12-byte header.
    pub fn write_header(&mut self, marker: bool, payload_len: usize) -> [u8; 12] {
        let header = self.header.write(marker);
        self.packet_count += 1;
        self.octet_count += payload_len as u64;
        self.total_octet_count += 12 + payload_len as u64;
        header
    }

    pub fn advance_timestamp(&mut self, increment: u32) {
        self.header.advance_timestamp(increment);
    }

    pub fn transmission_stats(&self) -> &RtpTransmissionStatsDb {
        &self.transmission_stats
    }

    pub fn note_incoming_rr(&mut self, report: &ReceiverReport) {
        self.transmission_stats.note_incoming_rr(report, Instant::now());
    }

    /// Average send bitrate in bits per second since creation, mirroring
    /// `RTPSink::getTotalBitrate`.
    pub fn total_bitrate(&self) -> f64 {
        let elapsed = self.creation_time.elapsed();
        if elapsed <= Duration::ZERO {
            return 0.0;
        }
        (self.total_octet_count as f64 * 8.0) / elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut core = RtpSinkCore::new(96, 90_000);
        core.write_header(false, 1400);
        core.write_header(true, 200);
        assert_eq!(core.packet_count(), 2);
        assert_eq!(core.octet_count(), 1600);
        assert_eq!(core.total_octet_count(), 1600 + 24);
    }

    #[test]
    fn preset_timestamp_is_honored_by_next_write() {
        let mut core = RtpSinkCore::new(96, 90_000);
        core.preset_next_timestamp(123_456);
        assert_eq!(core.current_timestamp(), 123_456);
    }

    #[test]
    fn stats_db_tracks_per_ssrc() {
        let mut db = RtpTransmissionStatsDb::new();
        let report = ReceiverReport {
            ssrc: 42,
            fraction_lost: 0,
            cumulative_packets_lost: 3,
            extended_highest_sequence: 1000,
            interarrival_jitter: 5,
            last_sr_timestamp: 0,
            delay_since_last_sr: 0,
        };
        db.note_incoming_rr(&report, Instant::now());
        assert_eq!(db.num_receivers(), 1);
        assert_eq!(db.lookup(42).unwrap().total_num_packets_lost, 3);
        db.remove_record(42);
        assert_eq!(db.num_receivers(), 0);
    }
}
