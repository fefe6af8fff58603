//! Media codecs and the on-demand source/filter/sink pipeline.
//!
//! This module provides the [`crate::session_media::ServerMediaSubsession`]
//! implementations (one per codec) and the pull-model pipeline they compose:
//! a [`FramedSource`](framed_source::FramedSource) (e.g.
//! [`byte_stream_file_source::ByteStreamFileSource`]) feeds a
//! [`nal_framer::NalUnitStreamFramer`], which feeds a
//! [`fragmenter::Fragmenter`], which feeds a
//! [`multi_framed_rtp_sink::MultiFramedRtpSink`].
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded video frame is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp_sink::RtpSinkCore`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping) — for reordering and loss detection.
//! - **Timestamp** (32-bit) — media clock, typically 90 kHz for video.
//! - **SSRC** (32-bit) — randomly chosen to identify the sender.
//! - **Marker bit** — set on the last packet of an access unit (frame).
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC | Status |
//! |-------|--------|-----|--------|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | Implemented |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) | Implemented |
//! | MJPEG | [`mjpeg`] | [RFC 2435](https://tools.ietf.org/html/rfc2435) | Out of scope (not a Non-goal exception; see §1) |

pub mod byte_stream_file_source;
pub mod fragmenter;
pub mod framed_source;
pub mod h264;
pub mod h265;
pub mod mjpeg;
pub mod nal_framer;
pub mod out_packet_buffer;
pub mod rtp;
pub mod rtp_sink;
pub mod multi_framed_rtp_sink;
