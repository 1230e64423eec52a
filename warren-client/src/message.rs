use crate::model::ChannelNumber;
use bytes::Bytes;
use warren_codec::frame::{BasicDeliverArgs, BasicProperties, BasicReturnArgs};

/// A message delivered to a consumer.
///
/// With the `delivery_tag` a client can send back acknowledgements to the server, saying that the
/// message was successfully arrived.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Delivery {
    pub channel: ChannelNumber,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// A mandatory message which couldn't be routed and came back from the broker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReturnedMessage {
    pub channel: ChannelNumber,
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Publisher confirm sent by the broker in confirm mode.
#[derive(Clone, Debug, PartialEq)]
pub enum Confirm {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool, requeue: bool },
}

/// The method frame which starts a content, the header and the body frames follow it.
#[derive(Debug)]
pub(crate) enum ContentStart {
    Deliver(BasicDeliverArgs),
    Return(BasicReturnArgs),
}

/// A message being assembled from a method, a header and body frames.
#[derive(Debug)]
pub(crate) struct IncomingContent {
    pub(crate) start: ContentStart,
    pub(crate) header: Option<(u64, BasicProperties)>,
    pub(crate) body: bytes::BytesMut,
}

pub(crate) enum Assembled {
    Delivery(Delivery),
    Returned(ReturnedMessage),
}

impl IncomingContent {
    pub(crate) fn new(start: ContentStart) -> Self {
        Self {
            start,
            header: None,
            body: bytes::BytesMut::new(),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        matches!(self.header, Some((size, _)) if self.body.len() as u64 == size)
    }

    /// More body bytes arrived than the content header declared.
    pub(crate) fn is_overrun(&self) -> bool {
        matches!(self.header, Some((size, _)) if self.body.len() as u64 > size)
    }

    pub(crate) fn into_message(self, channel: ChannelNumber) -> Assembled {
        let properties = self.header.map(|(_, p)| p).unwrap_or_default();
        let body = self.body.freeze();

        match self.start {
            ContentStart::Deliver(args) => Assembled::Delivery(Delivery {
                channel,
                consumer_tag: args.consumer_tag,
                delivery_tag: args.delivery_tag,
                redelivered: args.redelivered,
                exchange: args.exchange_name,
                routing_key: args.routing_key,
                properties,
                body,
            }),
            ContentStart::Return(args) => Assembled::Returned(ReturnedMessage {
                channel,
                reply_code: args.reply_code,
                reply_text: args.reply_text,
                exchange: args.exchange_name,
                routing_key: args.routing_key,
                properties,
                body,
            }),
        }
    }
}
