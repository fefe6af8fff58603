//! RTCP sender/receiver reports (RFC 3550 §6.4), supplemented beyond the
//! distilled spec per `SPEC_FULL.md` §0.5: just enough wire support to send
//! SR packets on the configured cadence and decode incoming RR/BYE so
//! [`crate::media::rtp_sink::RtpSinkCore`] can populate its transmission
//! stats. No SDES, no APP, no compound-packet padding validation — a
//! genuinely full RTCP stack is out of scope for this server.

use crate::error::{ParseErrorKind, RtspError};
use crate::Result;

const RTP_VERSION: u8 = 2;
const PT_SR: u8 = 200;
const PT_RR: u8 = 201;
const PT_SDES: u8 = 202;
const PT_BYE: u8 = 203;
const PT_APP: u8 = 204;

/// NTP timestamp as transmitted in a sender report: seconds since 1900-01-01
/// plus a 32-bit fractional part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Converts a Unix timestamp (seconds since epoch, as an `f64` for
    /// sub-second precision) to NTP form.
    pub fn from_unix_secs(unix_secs: f64) -> Self {
        const NTP_UNIX_EPOCH_DELTA: u32 = 2_208_988_800;
        let seconds = unix_secs.trunc() as u32 + NTP_UNIX_EPOCH_DELTA;
        let fraction = (unix_secs.fract() * (u32::MAX as f64)) as u32;
        NtpTimestamp { seconds, fraction }
    }
}

/// A sender report, emitted periodically by this server for each stream it
/// is sending (RFC 3550 §6.4.1). This server never includes report blocks
/// of its own (it does not itself receive RTP from clients), matching
/// live555's `RTCPInstance` behavior for a pure sender.
#[derive(Debug, Clone)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    /// Encodes the SR packet (header + sender-info, no report blocks, no
    /// following SDES — callers append an SDES CNAME packet separately if
    /// they want a compound RTCP packet, matching RFC 3550 §6.1's
    /// requirement that every compound packet start with SR/RR then SDES).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28);
        // V=2, P=0, RC=0
        out.push((RTP_VERSION << 6) | 0);
        out.push(PT_SR);
        let length_words: u16 = 6; // (28 bytes / 4) - 1
        out.extend_from_slice(&length_words.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(&self.ntp_timestamp.seconds.to_be_bytes());
        out.extend_from_slice(&self.ntp_timestamp.fraction.to_be_bytes());
        out.extend_from_slice(&self.rtp_timestamp.to_be_bytes());
        out.extend_from_slice(&self.packet_count.to_be_bytes());
        out.extend_from_slice(&self.octet_count.to_be_bytes());
        out
    }
}

/// One report block from an incoming RR or SR (RFC 3550 §6.4.1/.2).
#[derive(Debug, Clone, Copy)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_packets_lost: i32,
    pub extended_highest_sequence: u32,
    pub interarrival_jitter: u32,
    pub last_sr_timestamp: u32,
    pub delay_since_last_sr: u32,
}

/// A decoded RTCP packet, limited to the subset this server acts on.
#[derive(Debug, Clone)]
pub enum RtcpPacket {
    ReceiverReport { sender_ssrc: u32, reports: Vec<ReceiverReport> },
    SenderReport { sender_ssrc: u32, reports: Vec<ReceiverReport> },
    Bye { ssrcs: Vec<u32> },
    Other { payload_type: u8 },
}

/// Parses one or more RTCP packets out of a compound packet (RFC 3550
/// §6.1: a BYE/APP must end the compound, but RR/SR/SDES can be followed by
/// more). Unknown packet types are reported as `RtcpPacket::Other` so a
/// caller can still advance past them. Malformed length fields return
/// `Err` rather than looping forever.
pub fn decode_compound(mut data: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    while data.len() >= 4 {
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            });
        }
        let report_count = (data[0] & 0x1F) as usize;
        let payload_type = data[1];
        let length_words = u16::from_be_bytes([data[2], data[3]]) as usize;
        let packet_len = (length_words + 1) * 4;
        if packet_len > data.len() {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::TruncatedBody,
            });
        }
        let body = &data[4..packet_len];

        match payload_type {
            PT_SR | PT_RR => {
                if body.len() < 4 {
                    return Err(RtspError::Parse {
                        kind: ParseErrorKind::InvalidHeader,
                    });
                }
                let sender_ssrc = u32::from_be_bytes(body[0..4].try_into().unwrap());
                let block_offset = if payload_type == PT_SR { 4 + 20 } else { 4 };
                let reports = decode_report_blocks(&body[block_offset.min(body.len())..], report_count)?;
                packets.push(if payload_type == PT_SR {
                    RtcpPacket::SenderReport { sender_ssrc, reports }
                } else {
                    RtcpPacket::ReceiverReport { sender_ssrc, reports }
                });
            }
            PT_BYE => {
                let mut ssrcs = Vec::with_capacity(report_count);
                for i in 0..report_count {
                    let off = i * 4;
                    if off + 4 > body.len() {
                        break;
                    }
                    ssrcs.push(u32::from_be_bytes(body[off..off + 4].try_into().unwrap()));
                }
                packets.push(RtcpPacket::Bye { ssrcs });
            }
            PT_SDES | PT_APP => {
                packets.push(RtcpPacket::Other { payload_type });
            }
            other => {
                packets.push(RtcpPacket::Other { payload_type: other });
            }
        }

        data = &data[packet_len..];
    }
    Ok(packets)
}

fn decode_report_blocks(body: &[u8], count: usize) -> Result<Vec<ReceiverReport>> {
    let mut reports = Vec::with_capacity(count);
    for i in 0..count {
        let off = i * 24;
        if off + 24 > body.len() {
            break;
        }
        let block = &body[off..off + 24];
        let fraction_lost = block[4];
        let cumulative_packets_lost = i32::from_be_bytes([0, block[5], block[6], block[7]]) << 8 >> 8;
        reports.push(ReceiverReport {
            ssrc: u32::from_be_bytes(block[0..4].try_into().unwrap()),
            fraction_lost,
            cumulative_packets_lost,
            extended_highest_sequence: u32::from_be_bytes(block[8..12].try_into().unwrap()),
            interarrival_jitter: u32::from_be_bytes(block[12..16].try_into().unwrap()),
            last_sr_timestamp: u32::from_be_bytes(block[16..20].try_into().unwrap()),
            delay_since_last_sr: u32::from_be_bytes(block[20..24].try_into().unwrap()),
        });
    }
    Ok(reports)
}

/// Encodes a minimal BYE packet (no "reason for leaving" string), used when
/// a stream is torn down while it still has active RTCP receivers.
pub fn encode_bye(ssrc: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.push((RTP_VERSION << 6) | 1);
    out.push(PT_BYE);
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sr_round_trips_through_manual_decode() {
        let sr = SenderReport {
            ssrc: 0xDEADBEEF,
            ntp_timestamp: NtpTimestamp::from_unix_secs(1_700_000_000.5),
            rtp_timestamp: 90_000,
            packet_count: 10,
            octet_count: 14_000,
        };
        let bytes = sr.encode();
        assert_eq!(bytes.len(), 28);
        assert_eq!(bytes[1], PT_SR);
        assert_eq!(u32::from_be_bytes(bytes[4..8].try_into().unwrap()), 0xDEADBEEF);
        assert_eq!(u32::from_be_bytes(bytes[16..20].try_into().unwrap()), 90_000);
    }

    #[test]
    fn decodes_rr_with_one_report_block() {
        let mut body = Vec::new();
        body.push((RTP_VERSION << 6) | 1);
        body.push(PT_RR);
        body.extend_from_slice(&7u16.to_be_bytes()); // (32/4)-1
        body.extend_from_slice(&0x11111111u32.to_be_bytes()); // sender ssrc
        body.extend_from_slice(&0x22222222u32.to_be_bytes()); // report ssrc
        body.push(10); // fraction lost
        body.extend_from_slice(&[0, 0, 5]); // cumulative lost = 5
        body.extend_from_slice(&1000u32.to_be_bytes());
        body.extend_from_slice(&42u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());

        let packets = decode_compound(&body).unwrap();
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            RtcpPacket::ReceiverReport { sender_ssrc, reports } => {
                assert_eq!(*sender_ssrc, 0x11111111);
                assert_eq!(reports.len(), 1);
                assert_eq!(reports[0].ssrc, 0x22222222);
                assert_eq!(reports[0].cumulative_packets_lost, 5);
                assert_eq!(reports[0].interarrival_jitter, 42);
            }
            other => panic!("expected ReceiverReport, got {other:?}"),
        }
    }

    #[test]
    fn decodes_bye_with_multiple_ssrcs() {
        let mut body = Vec::new();
        body.push((RTP_VERSION << 6) | 2);
        body.push(PT_BYE);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&2u32.to_be_bytes());

        let packets = decode_compound(&body).unwrap();
        match &packets[0] {
            RtcpPacket::Bye { ssrcs } => assert_eq!(ssrcs, &vec![1, 2]),
            other => panic!("expected Bye, got {other:?}"),
        }
    }

    #[test]
    fn truncated_packet_is_rejected_not_looped_forever() {
        let mut body = Vec::new();
        body.push((RTP_VERSION << 6) | 0);
        body.push(PT_SR);
        body.extend_from_slice(&0xFFFFu16.to_be_bytes());
        assert!(decode_compound(&body).is_err());
    }
}
