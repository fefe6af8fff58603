//! On-demand H.264 subsession (RFC 6184), grounded in
//! `H264VideoFileServerMediaSubsession.cpp`'s pairing of a
//! `ByteStreamFileSource` with an `H264VideoRTPSink`.
//!
//! SPS/PPS are sniffed once from the backing file at construction time so
//! `sdp_attributes` can build `profile-level-id`/`sprop-parameter-sets`
//! before any client has SETUP/PLAYed — DESCRIBE must not block on
//! streaming state.

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;

use crate::error::Result;
use crate::media::byte_stream_file_source::ByteStreamFileSource;
use crate::media::fragmenter::Fragmenter;
use crate::media::framed_source::FramedSource;
use crate::media::multi_framed_rtp_sink::{MarkerBit, MultiFramedRtpSink, PacketSink};
use crate::media::nal_framer::{NalUnitStreamFramer, VideoCodec};
use crate::media::rtp_sink::RtpSinkCore;
use crate::scheduler::Scheduler;
use crate::session_media::ServerMediaSubsession;

const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// Serves an H.264 Annex B file as a single on-demand track (RFC 6184 §5.6/§5.8).
pub struct H264FileSubsession {
    path: String,
    payload_type: u8,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264FileSubsession {
    /// Opens `path` and sniffs the first SPS/PPS NAL units for SDP `fmtp`.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let data = std::fs::read(&path)?;

        let mut sps = None;
        let mut pps = None;
        for nal in extract_nal_units(&data) {
            if nal.is_empty() {
                continue;
            }
            match nal[0] & 0x1f {
                7 if sps.is_none() => sps = Some(nal),
                8 if pps.is_none() => pps = Some(nal),
                _ => {}
            }
        }

        Ok(H264FileSubsession { path, payload_type: DEFAULT_PAYLOAD_TYPE, sps, pps })
    }

    /// Derive profile-level-id from SPS NAL (RFC 6184 §8.1): bytes 1-3 are
    /// profile_idc, constraint_set, level_idc.
    fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02X}{:02X}{:02X}", sps[1], sps[2], sps[3]))
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!("{},{}", BASE64_STANDARD.encode(sps), BASE64_STANDARD.encode(pps)))
    }
}

impl ServerMediaSubsession for H264FileSubsession {
    fn track_id(&self) -> &str {
        "track1"
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// 90 kHz clock rate per RFC 6184 §8.1.
    fn clock_rate(&self) -> u32 {
        90_000
    }

    /// SDP attributes per RFC 6184 §8.2.1. `a=rtpmap` must precede `a=fmtp`,
    /// which references its payload type.
    fn sdp_attributes(&self) -> Vec<String> {
        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.payload_type);
        if let Some(pl) = self.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={}", pl));
        }
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={}", sprop));
        }

        vec![
            format!("a=rtpmap:{} H264/{}", self.payload_type, self.clock_rate()),
            fmtp,
            format!("a=control:{}", self.track_id()),
        ]
    }

    fn create_new_stream_source(&self, scheduler: Scheduler) -> Result<Box<dyn FramedSource>> {
        Ok(Box::new(ByteStreamFileSource::new(&self.path, scheduler)?))
    }

    fn create_new_rtp_sink(
        &self,
        core: RtpSinkCore,
        source: Box<dyn FramedSource>,
        sink: Box<dyn PacketSink>,
        max_output_packet_size: usize,
        scheduler: Scheduler,
    ) -> MultiFramedRtpSink {
        let framer = NalUnitStreamFramer::new(VideoCodec::H264, source, scheduler.clone());
        let picture_end_marker = framer.picture_end_marker_handle();

        let fragmenter = Fragmenter::new(VideoCodec::H264, Box::new(framer), max_output_packet_size, scheduler.clone());
        let last_fragment_completed = fragmenter.last_fragment_completed_handle();

        let marker = MarkerBit::new(last_fragment_completed, picture_end_marker);
        MultiFramedRtpSink::new(core, Box::new(fragmenter), sink, max_output_packet_size, scheduler, Some(marker))
    }
}

/// Extracts NAL units from an H.264 Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte `00 00 01`)
/// and returns the NAL data between them, excluding the start codes
/// themselves. Start code length is tracked per-NAL so boundaries between
/// adjacent NALs are computed correctly when 3-byte and 4-byte start codes
/// are mixed.
pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
    let mut nal_units = Vec::new();
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = if idx + 1 < start_entries.len() {
            let (next_start, next_sc_len) = start_entries[idx + 1];
            next_start - next_sc_len
        } else {
            data.len()
        };

        if start < end {
            nal_units.push(data[start..end].to_vec());
        }
    }

    nal_units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("rtsp_rs_h264_test_{}", name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn extracts_nal_units_across_four_byte_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
    }

    #[test]
    fn extracts_nal_units_with_mixed_three_and_four_byte_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
    }

    #[test]
    fn captures_sps_and_pps_and_builds_fmtp_with_sprop() {
        let sps_nal = vec![0x67, 0x42, 0x00, 0x1e];
        let pps_nal = vec![0x68, 0xce, 0x38, 0x80];
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(&sps_nal);
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(&pps_nal);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x00]);

        let path = temp_file("sps_pps", &data);
        let sub = H264FileSubsession::new(path.to_string_lossy().to_string()).unwrap();
        let attrs = sub.sdp_attributes();
        let fmtp = attrs.iter().find(|a| a.starts_with("a=fmtp:")).expect("fmtp line");
        assert!(fmtp.contains("profile-level-id="));
        assert!(fmtp.contains("sprop-parameter-sets="));

        let rtpmap = attrs.iter().find(|a| a.starts_with("a=rtpmap:")).expect("rtpmap line");
        assert_eq!(rtpmap, "a=rtpmap:96 H264/90000");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn profile_level_id_matches_scenario_1_literal() {
        let sps_nal = vec![0x67, 0x42, 0x00, 0x1e];
        let pps_nal = vec![0x68, 0xce, 0x3c, 0x80];
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(&sps_nal);
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(&pps_nal);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x00]);

        let path = temp_file("profile_level_id_literal", &data);
        let sub = H264FileSubsession::new(path.to_string_lossy().to_string()).unwrap();
        let attrs = sub.sdp_attributes();
        let fmtp = attrs.iter().find(|a| a.starts_with("a=fmtp:")).expect("fmtp line");
        assert_eq!(
            fmtp,
            "a=fmtp:96 packetization-mode=1;profile-level-id=42001E;sprop-parameter-sets=Z0IAHg==,aM48gA=="
        );

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_sps_pps_still_emits_packetization_mode_only() {
        let data = vec![0, 0, 0, 1, 0x65, 0x88, 0x00];
        let path = temp_file("no_sps", &data);
        let sub = H264FileSubsession::new(path.to_string_lossy().to_string()).unwrap();
        let attrs = sub.sdp_attributes();
        let fmtp = attrs.iter().find(|a| a.starts_with("a=fmtp:")).expect("fmtp line");
        assert_eq!(fmtp, "a=fmtp:96 packetization-mode=1");

        std::fs::remove_file(path).ok();
    }
}
