use crate::error::{ClientError, ErrorKind};
use crate::model::ConnectionError;
use anyhow::Result;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use warren_codec::codec::{self, AMQPCodec, Frame};
use warren_codec::frame::AMQPFrame;

/// Turn an io error of the framed stream into a client error. Decode errors of the codec have
/// their own kind and reply code.
pub(crate) fn io_error(err: io::Error) -> anyhow::Error {
    let client_error = match codec::as_decode_error(&err) {
        Some(decode_error) => ClientError {
            kind: ErrorKind::ProtocolDecode,
            channel: None,
            code: decode_error.reply_code(),
            message: decode_error.to_string(),
            class_method: 0,
        },
        None => ClientError {
            kind: ErrorKind::Transport,
            channel: None,
            code: ConnectionError::InternalError as u16,
            message: err.to_string(),
            class_method: 0,
        },
    };

    anyhow::Error::new(client_error)
}

fn transport_error(message: &str) -> anyhow::Error {
    anyhow::Error::new(ClientError {
        kind: ErrorKind::Transport,
        channel: None,
        code: ConnectionError::InternalError as u16,
        message: message.to_string(),
        class_method: 0,
    })
}

/// Frames over a byte stream. It is used as is during the handshake, then it is split into a
/// reader and a writer half for the reader and writer tasks of the connection.
pub struct FrameTransport<S> {
    framed: Framed<S, AMQPCodec>,
    pending: VecDeque<AMQPFrame>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, AMQPCodec::default()),
            pending: VecDeque::new(),
        }
    }

    /// Read the next frame which is not a heartbeat.
    pub async fn read_frame(&mut self) -> Result<AMQPFrame> {
        read_next(&mut self.framed, &mut self.pending, None).await
    }

    pub async fn write_frame(&mut self, frame: impl Into<Frame>) -> Result<()> {
        self.framed.send(frame.into()).await.map_err(io_error)
    }

    /// Incoming frames bigger than this are rejected with a frame error.
    pub fn set_frame_max(&mut self, frame_max: usize) {
        self.framed.codec_mut().frame_max = frame_max;
    }

    /// Split the transport, heartbeat is the negotiated interval, `None` if it is disabled.
    pub fn split(self, heartbeat: Option<Duration>) -> (FrameReader<S>, FrameWriter<S>) {
        let (sink, stream) = self.framed.split();

        (
            FrameReader {
                stream,
                pending: self.pending,
                heartbeat,
            },
            FrameWriter { sink },
        )
    }
}

pub struct FrameReader<S> {
    stream: SplitStream<Framed<S, AMQPCodec>>,
    pending: VecDeque<AMQPFrame>,
    heartbeat: Option<Duration>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameReader<S> {
    /// Read the next frame which is not a heartbeat. If the heartbeat is on, two intervals
    /// without any frame from the broker is a transport failure.
    pub async fn read_frame(&mut self) -> Result<AMQPFrame> {
        read_next(&mut self.stream, &mut self.pending, self.heartbeat.map(|hb| hb * 2)).await
    }
}

pub struct FrameWriter<S> {
    sink: SplitSink<Framed<S, AMQPCodec>, Frame>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameWriter<S> {
    pub async fn write_frame(&mut self, frame: impl Into<Frame>) -> Result<()> {
        self.sink.send(frame.into()).await.map_err(io_error)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.map_err(io_error)
    }
}

async fn read_next<T>(stream: &mut T, pending: &mut VecDeque<AMQPFrame>, silence: Option<Duration>) -> Result<AMQPFrame>
where
    T: futures::Stream<Item = io::Result<Frame>> + Unpin,
{
    loop {
        if let Some(frame) = pending.pop_front() {
            return Ok(frame);
        }

        let next = match silence {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| transport_error("missed heartbeats from the broker"))?,
            None => stream.next().await,
        };

        match next {
            Some(Ok(Frame::Frame(AMQPFrame::Heartbeat(_)))) => {
                log::trace!("Heartbeat received");
            }
            Some(Ok(Frame::Frame(frame))) => {
                log::trace!("Incoming frame {frame:?}");

                return Ok(frame);
            }
            Some(Ok(Frame::Frames(frames))) => {
                pending.extend(frames.into_iter().filter(|f| !matches!(f, AMQPFrame::Heartbeat(_))));
            }
            Some(Err(e)) => return Err(io_error(e)),
            None => return Err(transport_error("connection closed by the broker")),
        }
    }
}
