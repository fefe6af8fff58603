//! On-demand H.265/HEVC subsession (RFC 7798), grounded in
//! `H265VideoFileServerMediaSubsession.cpp`'s pairing of a
//! `ByteStreamFileSource` with an `H265VideoRTPSink`.
//!
//! Structurally mirrors [`super::h264::H264FileSubsession`]: VPS/SPS/PPS
//! (NAL types 32/33/34) are sniffed once from the backing file so
//! `sdp_attributes` can build `sprop-vps`/`sprop-sps`/`sprop-pps` ahead of
//! any SETUP/PLAY.

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

fn nal_type(nal: &[u8]) -> u8 {
    (nal[0] >> 1) & 0x3F
}

/// Serves an HEVC Annex B file as a single on-demand track (RFC 7798 §4.4.1/§4.4.3).
pub struct H265FileSubsession {
    path: String,
    payload_type: u8,
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H265FileSubsession {
    /// Opens `path` and sniffs the first VPS/SPS/PPS NAL units for SDP `fmtp`.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let data = std::fs::read(&path)?;

        let mut vps = None;
        let mut sps = None;
        let mut pps = None;
        for nal in super::h264::extract_nal_units(&data) {
            if nal.len() < 2 {
                continue;
            }
            match nal_type(&nal) {
                32 if vps.is_none() => vps = Some(nal),
                33 if sps.is_none() => sps = Some(nal),
                34 if pps.is_none() => pps = Some(nal),
                _ => {}
            }
        }

        Ok(H265FileSubsession { path, payload_type: DEFAULT_PAYLOAD_TYPE, vps, sps, pps })
    }
}

impl ServerMediaSubsession for H265FileSubsession {
    fn track_id(&self) -> &str {
        "track1"
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// 90 kHz clock rate per RFC 7798 §7.1.
    fn clock_rate(&self) -> u32 {
        90_000
    }

    /// SDP attributes per RFC 7798 §7.1. `a=fmtp` is omitted entirely when no
    /// parameter sets were captured from the file.
    fn sdp_attributes(&self) -> Vec<String> {
        let mut fmtp_parts = Vec::new();
        if let Some(vps) = &self.vps {
            fmtp_parts.push(format!("sprop-vps={}", BASE64_STANDARD.encode(vps)));
        }
        if let Some(sps) = &self.sps {
            fmtp_parts.push(format!("sprop-sps={}", BASE64_STANDARD.encode(sps)));
        }
        if let Some(pps) = &self.pps {
            fmtp_parts.push(format!("sprop-pps={}", BASE64_STANDARD.encode(pps)));
        }

        let mut attrs = vec![format!("a=rtpmap:{} H265/{}", self.payload_type, self.clock_rate())];
        if !fmtp_parts.is_empty() {
            attrs.push(format!("a=fmtp:{} {}", self.payload_type, fmtp_parts.join(";")));
        }
        attrs.push(format!("a=control:{}", self.track_id()));
        attrs
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
        let framer = NalUnitStreamFramer::new(VideoCodec::H265, source, scheduler.clone());
        let picture_end_marker = framer.picture_end_marker_handle();

        let fragmenter = Fragmenter::new(VideoCodec::H265, Box::new(framer), max_output_packet_size, scheduler.clone());
        let last_fragment_completed = fragmenter.last_fragment_completed_handle();

        let marker = MarkerBit::new(last_fragment_completed, picture_end_marker);
        MultiFramedRtpSink::new(core, Box::new(fragmenter), sink, max_output_packet_size, scheduler, Some(marker))
    }
}
