use crate::frame::*;
use crate::method::{
    content_header_size, decode_content_header, decode_method, encode_content_header, encode_method, required_size,
};
use crate::wire::get_u32;
use crate::ProtocolDecodeError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const FRAME_METHOD_FRAME: u8 = 0x01;
const FRAME_CONTENT_HEADER: u8 = 0x02;
const FRAME_CONTENT_BODY: u8 = 0x03;
const FRAME_HEARTBEAT: u8 = 0x08;
const FRAME_AMQP_VERSION: u8 = 0x41;
const FRAME_END: u8 = 0xCE;

/// Type, channel and size of the frame.
const FRAME_HEADER_SIZE: usize = 7;

/// Bytes of a frame which are not payload: the frame header and the end marker.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Frame size every peer accepts, it is the limit until the connection is tuned.
pub const FRAME_MIN_SIZE: usize = 4096;

/// AMQP frame encoder and decoder.
///
/// `frame_max` limits the size of incoming frames, it starts at [`FRAME_MIN_SIZE`]. 0 means no
/// limit, when both peers tuned the connection so.
#[derive(Debug)]
pub struct AMQPCodec {
    pub frame_max: usize,
}

impl Default for AMQPCodec {
    fn default() -> Self {
        AMQPCodec {
            frame_max: FRAME_MIN_SIZE,
        }
    }
}

impl AMQPCodec {
    pub fn with_frame_max(frame_max: usize) -> Self {
        AMQPCodec { frame_max }
    }
}

#[derive(Debug)]
pub enum Frame {
    Frame(AMQPFrame),
    Frames(Vec<AMQPFrame>),
}

impl From<AMQPFrame> for Frame {
    fn from(frame: AMQPFrame) -> Self {
        Frame::Frame(frame)
    }
}

/// Decode errors travel as `InvalidData` io errors through the `tokio_util` machinery, the
/// original [`ProtocolDecodeError`] is the inner error.
pub fn decode_error(err: ProtocolDecodeError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}

/// Get back the decode error from an io error produced by the decoder.
pub fn as_decode_error(err: &std::io::Error) -> Option<&ProtocolDecodeError> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<ProtocolDecodeError>())
}

impl Encoder<Frame> for AMQPCodec {
    type Error = std::io::Error;

    fn encode(&mut self, event: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        match event {
            Frame::Frame(frame) => encode_amqp_frame(buf, frame),
            Frame::Frames(frames) => {
                for frame in frames {
                    encode_amqp_frame(buf, frame);
                }
            }
        }

        Ok(())
    }
}

impl Decoder for AMQPCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match src[0] {
            FRAME_AMQP_VERSION => return decode_protocol_header(src),
            FRAME_METHOD_FRAME | FRAME_CONTENT_HEADER | FRAME_CONTENT_BODY | FRAME_HEARTBEAT => (),
            t => return Err(decode_error(ProtocolDecodeError::UnknownFrameType(t))),
        }

        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        let frame_size = frame_len + FRAME_OVERHEAD;

        if self.frame_max > 0 && frame_size > self.frame_max {
            return Err(decode_error(ProtocolDecodeError::FrameTooLarge {
                size: frame_size,
                max: self.frame_max,
            }));
        }

        if src.len() < frame_size {
            src.reserve(frame_size - src.len());

            return Ok(None);
        }

        let frame_type = src.get_u8();
        let channel = src.get_u16();
        let _ = src.get_u32();
        let mut payload = src.split_to(frame_len);
        let frame_end = src.get_u8();

        if frame_end != FRAME_END {
            return Err(decode_error(ProtocolDecodeError::FrameEndMismatch(frame_end)));
        }

        decode_frame(frame_type, channel, &mut payload)
            .map(|frame| Some(Frame::Frame(frame)))
            .map_err(decode_error)
    }
}

fn decode_protocol_header(src: &mut BytesMut) -> Result<Option<Frame>, std::io::Error> {
    if src.len() < PROTOCOL_HEADER.len() {
        return Ok(None);
    }

    let mut head = [0u8; 8];
    src.copy_to_slice(&mut head);

    if &head != PROTOCOL_HEADER {
        return Err(decode_error(ProtocolDecodeError::BadProtocolHeader(head)));
    }

    Ok(Some(Frame::Frame(AMQPFrame::Header)))
}

fn decode_frame(frame_type: u8, channel: Channel, payload: &mut BytesMut) -> crate::Result<AMQPFrame> {
    let frame = match frame_type {
        FRAME_METHOD_FRAME => {
            let class_method = get_u32(payload)?;
            let args = decode_method(class_method, payload)?;

            AMQPFrame::Method(channel, class_method, args)
        }
        FRAME_CONTENT_HEADER => AMQPFrame::ContentHeader(decode_content_header(channel, payload)?),
        FRAME_CONTENT_BODY => AMQPFrame::ContentBody(ContentBodyFrame {
            channel,
            body: payload.split().freeze(),
        }),
        FRAME_HEARTBEAT => AMQPFrame::Heartbeat(channel),
        t => return Err(ProtocolDecodeError::UnknownFrameType(t)),
    };

    Ok(frame)
}

/// The number of bytes the frame takes on the wire, envelope included.
pub fn encoded_size(frame: &AMQPFrame) -> usize {
    match frame {
        AMQPFrame::Header => PROTOCOL_HEADER.len(),
        AMQPFrame::Method(_, _, args) => FRAME_OVERHEAD + 4 + required_size(args),
        AMQPFrame::ContentHeader(hf) => FRAME_OVERHEAD + content_header_size(hf),
        AMQPFrame::ContentBody(bf) => FRAME_OVERHEAD + bf.body.len(),
        AMQPFrame::Heartbeat(_) => FRAME_OVERHEAD,
    }
}

fn encode_amqp_frame(buf: &mut BytesMut, frame: AMQPFrame) {
    buf.reserve(encoded_size(&frame));

    match frame {
        AMQPFrame::Header => buf.put_slice(PROTOCOL_HEADER),
        AMQPFrame::Method(channel, cm, args) => {
            buf.put_u8(FRAME_METHOD_FRAME);
            buf.put_u16(channel);
            buf.put_u32((4 + required_size(&args)) as u32);
            buf.put_u32(cm);
            encode_method(&args, buf);
            buf.put_u8(FRAME_END);
        }
        AMQPFrame::ContentHeader(hf) => {
            buf.put_u8(FRAME_CONTENT_HEADER);
            buf.put_u16(hf.channel);
            buf.put_u32(content_header_size(&hf) as u32);
            encode_content_header(&hf, buf);
            buf.put_u8(FRAME_END);
        }
        AMQPFrame::ContentBody(bf) => {
            buf.put_u8(FRAME_CONTENT_BODY);
            buf.put_u16(bf.channel);
            buf.put_u32(bf.body.len() as u32);
            buf.put_slice(&bf.body);
            buf.put_u8(FRAME_END);
        }
        AMQPFrame::Heartbeat(channel) => {
            buf.put_u8(FRAME_HEARTBEAT);
            buf.put_u16(channel);
            buf.put_u32(0);
            buf.put_u8(FRAME_END);
        }
    }
}
