mod basic;
mod channel;
mod connection;
mod exchange;
mod queue;

pub use self::{
    basic::{
        confirm_select, confirm_select_ok, BasicAckArgs, BasicCancelArgs, BasicCancelOkArgs, BasicConsumeArgs,
        BasicConsumeFlags, BasicConsumeOkArgs, BasicDeliverArgs, BasicNackArgs, BasicNackFlags, BasicPublishArgs,
        BasicPublishFlags, BasicQosArgs, BasicRejectArgs, BasicReturnArgs, ConfirmSelectArgs,
    },
    channel::{
        channel_close, channel_close_ok, channel_flow, channel_flow_ok, channel_open, channel_open_ok,
        ChannelCloseArgs, ChannelFlowArgs,
    },
    connection::{
        connection_blocked, connection_close, connection_close_ok, connection_open_ok, connection_unblocked,
        ConnectionBlockedArgs, ConnectionCloseArgs, ConnectionOpenArgs, ConnectionStartArgs, ConnectionStartOkArgs,
        ConnectionTuneArgs, ConnectionTuneOkArgs,
    },
    exchange::{
        exchange_declare_ok, exchange_delete_ok, ExchangeDeclareArgs, ExchangeDeclareFlags, ExchangeDeleteArgs,
        ExchangeDeleteFlags,
    },
    queue::{
        queue_bind_ok, queue_unbind_ok, QueueBindArgs, QueueDeclareArgs, QueueDeclareFlags, QueueDeclareOkArgs,
        QueueDeleteArgs, QueueDeleteFlags, QueueDeleteOkArgs, QueuePurgeArgs, QueuePurgeOkArgs, QueueUnbindArgs,
    },
};
use bytes::Bytes;
use std::collections::HashMap;

pub const CONNECTION_START: u32 = 0x000A000A;
pub const CONNECTION_START_OK: u32 = 0x000A000B;
pub const CONNECTION_TUNE: u32 = 0x000A001E;
pub const CONNECTION_TUNE_OK: u32 = 0x000A001F;
pub const CONNECTION_OPEN: u32 = 0x000A0028;
pub const CONNECTION_OPEN_OK: u32 = 0x000A0029;
pub const CONNECTION_CLOSE: u32 = 0x000A0032;
pub const CONNECTION_CLOSE_OK: u32 = 0x000A0033;
pub const CONNECTION_BLOCKED: u32 = 0x000A003C;
pub const CONNECTION_UNBLOCKED: u32 = 0x000A003D;

pub const CHANNEL_OPEN: u32 = 0x0014000A;
pub const CHANNEL_OPEN_OK: u32 = 0x0014000B;
pub const CHANNEL_FLOW: u32 = 0x00140014;
pub const CHANNEL_FLOW_OK: u32 = 0x00140015;
pub const CHANNEL_CLOSE: u32 = 0x00140028;
pub const CHANNEL_CLOSE_OK: u32 = 0x00140029;

pub const EXCHANGE_DECLARE: u32 = 0x0028000A;
pub const EXCHANGE_DECLARE_OK: u32 = 0x0028000B;
pub const EXCHANGE_DELETE: u32 = 0x00280014;
pub const EXCHANGE_DELETE_OK: u32 = 0x00280015;

pub const QUEUE_DECLARE: u32 = 0x0032000A;
pub const QUEUE_DECLARE_OK: u32 = 0x0032000B;
pub const QUEUE_BIND: u32 = 0x00320014;
pub const QUEUE_BIND_OK: u32 = 0x00320015;
pub const QUEUE_PURGE: u32 = 0x0032001E;
pub const QUEUE_PURGE_OK: u32 = 0x0032001F;
pub const QUEUE_DELETE: u32 = 0x00320028;
pub const QUEUE_DELETE_OK: u32 = 0x00320029;
pub const QUEUE_UNBIND: u32 = 0x00320032;
pub const QUEUE_UNBIND_OK: u32 = 0x00320033;

pub const BASIC_QOS: u32 = 0x003C000A;
pub const BASIC_QOS_OK: u32 = 0x003C000B;
pub const BASIC_CONSUME: u32 = 0x003C0014;
pub const BASIC_CONSUME_OK: u32 = 0x003C0015;
pub const BASIC_CANCEL: u32 = 0x003C001E;
pub const BASIC_CANCEL_OK: u32 = 0x003C001F;
pub const BASIC_PUBLISH: u32 = 0x003C0028;
pub const BASIC_RETURN: u32 = 0x003C0032;
pub const BASIC_DELIVER: u32 = 0x003C003C;
pub const BASIC_ACK: u32 = 0x003C0050;
pub const BASIC_REJECT: u32 = 0x003C005A;
pub const BASIC_NACK: u32 = 0x003C0078;

pub const CONFIRM_SELECT: u32 = 0x0055000A;
pub const CONFIRM_SELECT_OK: u32 = 0x0055000B;

/// Class id of the basic class, content headers carry it.
pub const BASIC_CLASS: u16 = 0x003C;

pub type Channel = u16;
pub type ClassMethod = u32;
pub type ClassId = u16;
pub type Weight = u16;

/// Represents an AMQP frame.
#[derive(Clone, PartialEq)]
pub enum AMQPFrame {
    /// Header is to be sent to the server at first, announcing the AMQP version we support
    Header,
    /// Represents the AMQP RPC frames. Connection based calls have a channel number 0, otherwise
    /// channel is the current channel on which the frames are sent. The RPC arguments are
    /// represented in `MethodFrameArgs`.
    Method(Channel, ClassMethod, MethodFrameArgs),
    ContentHeader(ContentHeaderFrame),
    ContentBody(ContentBodyFrame),
    Heartbeat(Channel),
}

impl AMQPFrame {
    /// The channel number the frame travels on. The protocol header belongs to channel 0.
    pub fn channel(&self) -> Channel {
        match self {
            AMQPFrame::Header => 0,
            AMQPFrame::Method(ch, _, _) => *ch,
            AMQPFrame::ContentHeader(hf) => hf.channel,
            AMQPFrame::ContentBody(bf) => bf.channel,
            AMQPFrame::Heartbeat(ch) => *ch,
        }
    }
}

impl std::fmt::Debug for AMQPFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AMQPFrame::Header => write!(f, "Header"),
            AMQPFrame::Method(ch, cm, args) => write!(f, "Method(channel={}, {:08X}, {:?})", ch, cm, args),
            AMQPFrame::ContentHeader(ch) => write!(f, "ContentHeader({:?})", ch),
            AMQPFrame::ContentBody(cb) => write!(f, "ContentBody({:?})", cb),
            AMQPFrame::Heartbeat(_) => write!(f, "Heartbeat"),
        }
    }
}

/// Represents all types of method frame arguments.
#[derive(Clone, Debug, PartialEq)]
pub enum MethodFrameArgs {
    ConnectionStart(ConnectionStartArgs),
    ConnectionStartOk(ConnectionStartOkArgs),
    ConnectionTune(ConnectionTuneArgs),
    ConnectionTuneOk(ConnectionTuneOkArgs),
    ConnectionOpen(ConnectionOpenArgs),
    ConnectionOpenOk,
    ConnectionClose(ConnectionCloseArgs),
    ConnectionCloseOk,
    ConnectionBlocked(ConnectionBlockedArgs),
    ConnectionUnblocked,
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow(ChannelFlowArgs),
    ChannelFlowOk(ChannelFlowArgs),
    ChannelClose(ChannelCloseArgs),
    ChannelCloseOk,
    ExchangeDeclare(ExchangeDeclareArgs),
    ExchangeDeclareOk,
    ExchangeDelete(ExchangeDeleteArgs),
    ExchangeDeleteOk,
    QueueDeclare(QueueDeclareArgs),
    QueueDeclareOk(QueueDeclareOkArgs),
    QueueBind(QueueBindArgs),
    QueueBindOk,
    QueuePurge(QueuePurgeArgs),
    QueuePurgeOk(QueuePurgeOkArgs),
    QueueDelete(QueueDeleteArgs),
    QueueDeleteOk(QueueDeleteOkArgs),
    QueueUnbind(QueueUnbindArgs),
    QueueUnbindOk,
    BasicQos(BasicQosArgs),
    BasicQosOk,
    BasicConsume(BasicConsumeArgs),
    BasicConsumeOk(BasicConsumeOkArgs),
    BasicCancel(BasicCancelArgs),
    BasicCancelOk(BasicCancelOkArgs),
    BasicPublish(BasicPublishArgs),
    BasicReturn(BasicReturnArgs),
    BasicDeliver(BasicDeliverArgs),
    BasicAck(BasicAckArgs),
    BasicReject(BasicRejectArgs),
    BasicNack(BasicNackArgs),
    ConfirmSelect(ConfirmSelectArgs),
    ConfirmSelectOk,
}

impl MethodFrameArgs {
    /// The packed class id and method id of the method.
    pub fn class_method(&self) -> ClassMethod {
        match self {
            MethodFrameArgs::ConnectionStart(_) => CONNECTION_START,
            MethodFrameArgs::ConnectionStartOk(_) => CONNECTION_START_OK,
            MethodFrameArgs::ConnectionTune(_) => CONNECTION_TUNE,
            MethodFrameArgs::ConnectionTuneOk(_) => CONNECTION_TUNE_OK,
            MethodFrameArgs::ConnectionOpen(_) => CONNECTION_OPEN,
            MethodFrameArgs::ConnectionOpenOk => CONNECTION_OPEN_OK,
            MethodFrameArgs::ConnectionClose(_) => CONNECTION_CLOSE,
            MethodFrameArgs::ConnectionCloseOk => CONNECTION_CLOSE_OK,
            MethodFrameArgs::ConnectionBlocked(_) => CONNECTION_BLOCKED,
            MethodFrameArgs::ConnectionUnblocked => CONNECTION_UNBLOCKED,
            MethodFrameArgs::ChannelOpen => CHANNEL_OPEN,
            MethodFrameArgs::ChannelOpenOk => CHANNEL_OPEN_OK,
            MethodFrameArgs::ChannelFlow(_) => CHANNEL_FLOW,
            MethodFrameArgs::ChannelFlowOk(_) => CHANNEL_FLOW_OK,
            MethodFrameArgs::ChannelClose(_) => CHANNEL_CLOSE,
            MethodFrameArgs::ChannelCloseOk => CHANNEL_CLOSE_OK,
            MethodFrameArgs::ExchangeDeclare(_) => EXCHANGE_DECLARE,
            MethodFrameArgs::ExchangeDeclareOk => EXCHANGE_DECLARE_OK,
            MethodFrameArgs::ExchangeDelete(_) => EXCHANGE_DELETE,
            MethodFrameArgs::ExchangeDeleteOk => EXCHANGE_DELETE_OK,
            MethodFrameArgs::QueueDeclare(_) => QUEUE_DECLARE,
            MethodFrameArgs::QueueDeclareOk(_) => QUEUE_DECLARE_OK,
            MethodFrameArgs::QueueBind(_) => QUEUE_BIND,
            MethodFrameArgs::QueueBindOk => QUEUE_BIND_OK,
            MethodFrameArgs::QueuePurge(_) => QUEUE_PURGE,
            MethodFrameArgs::QueuePurgeOk(_) => QUEUE_PURGE_OK,
            MethodFrameArgs::QueueDelete(_) => QUEUE_DELETE,
            MethodFrameArgs::QueueDeleteOk(_) => QUEUE_DELETE_OK,
            MethodFrameArgs::QueueUnbind(_) => QUEUE_UNBIND,
            MethodFrameArgs::QueueUnbindOk => QUEUE_UNBIND_OK,
            MethodFrameArgs::BasicQos(_) => BASIC_QOS,
            MethodFrameArgs::BasicQosOk => BASIC_QOS_OK,
            MethodFrameArgs::BasicConsume(_) => BASIC_CONSUME,
            MethodFrameArgs::BasicConsumeOk(_) => BASIC_CONSUME_OK,
            MethodFrameArgs::BasicCancel(_) => BASIC_CANCEL,
            MethodFrameArgs::BasicCancelOk(_) => BASIC_CANCEL_OK,
            MethodFrameArgs::BasicPublish(_) => BASIC_PUBLISH,
            MethodFrameArgs::BasicReturn(_) => BASIC_RETURN,
            MethodFrameArgs::BasicDeliver(_) => BASIC_DELIVER,
            MethodFrameArgs::BasicAck(_) => BASIC_ACK,
            MethodFrameArgs::BasicReject(_) => BASIC_REJECT,
            MethodFrameArgs::BasicNack(_) => BASIC_NACK,
            MethodFrameArgs::ConfirmSelect(_) => CONFIRM_SELECT,
            MethodFrameArgs::ConfirmSelectOk => CONFIRM_SELECT_OK,
        }
    }

    /// Wrap the arguments into a method frame of the given channel.
    pub fn frame(self, channel: Channel) -> AMQPFrame {
        AMQPFrame::Method(channel, self.class_method(), self)
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq)]
    pub struct HeaderPropertyFlags: u16 {
        const CLUSTER_ID       = 0b0000_0000_0000_0100;
        const APP_ID           = 0b0000_0000_0000_1000;
        const USER_ID          = 0b0000_0000_0001_0000;
        const MESSAGE_TYPE     = 0b0000_0000_0010_0000;
        const TIMESTAMP        = 0b0000_0000_0100_0000;
        const MESSAGE_ID       = 0b0000_0000_1000_0000;
        const EXPIRATION       = 0b0000_0001_0000_0000;
        const REPLY_TO         = 0b0000_0010_0000_0000;
        const CORRELATION_ID   = 0b0000_0100_0000_0000;
        const PRIORITY         = 0b0000_1000_0000_0000;
        const DELIVERY_MODE    = 0b0001_0000_0000_0000;
        const HEADERS          = 0b0010_0000_0000_0000;
        const CONTENT_ENCODING = 0b0100_0000_0000_0000;
        const CONTENT_TYPE     = 0b1000_0000_0000_0000;
    }
}

/// The 14 properties of the basic class. On the wire they follow the property flags in the
/// order of the highest flag bit first, absent properties take no space.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    /// Property flags reflecting which properties are present.
    pub fn flags(&self) -> HeaderPropertyFlags {
        let mut flags = HeaderPropertyFlags::empty();

        flags.set(HeaderPropertyFlags::CONTENT_TYPE, self.content_type.is_some());
        flags.set(HeaderPropertyFlags::CONTENT_ENCODING, self.content_encoding.is_some());
        flags.set(HeaderPropertyFlags::HEADERS, self.headers.is_some());
        flags.set(HeaderPropertyFlags::DELIVERY_MODE, self.delivery_mode.is_some());
        flags.set(HeaderPropertyFlags::PRIORITY, self.priority.is_some());
        flags.set(HeaderPropertyFlags::CORRELATION_ID, self.correlation_id.is_some());
        flags.set(HeaderPropertyFlags::REPLY_TO, self.reply_to.is_some());
        flags.set(HeaderPropertyFlags::EXPIRATION, self.expiration.is_some());
        flags.set(HeaderPropertyFlags::MESSAGE_ID, self.message_id.is_some());
        flags.set(HeaderPropertyFlags::TIMESTAMP, self.timestamp.is_some());
        flags.set(HeaderPropertyFlags::MESSAGE_TYPE, self.message_type.is_some());
        flags.set(HeaderPropertyFlags::USER_ID, self.user_id.is_some());
        flags.set(HeaderPropertyFlags::APP_ID, self.app_id.is_some());
        flags.set(HeaderPropertyFlags::CLUSTER_ID, self.cluster_id.is_some());

        flags
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    /// Delivery mode 2 makes the message persistent.
    pub fn persistent(mut self, mode: bool) -> Self {
        self.delivery_mode = Some(if mode { 2 } else { 1 });
        self
    }

    pub fn header(mut self, name: &str, value: AMQPFieldValue) -> Self {
        self.headers.get_or_insert_with(FieldTable::new).insert(name.to_string(), value);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContentHeaderFrame {
    pub channel: Channel,
    pub class_id: ClassId,
    pub weight: Weight,
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeaderFrame {
    pub fn new(channel: Channel, body_size: u64, properties: BasicProperties) -> Self {
        Self {
            channel,
            class_id: BASIC_CLASS,
            weight: 0,
            body_size,
            properties,
        }
    }

    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::ContentHeader(self)
    }
}

#[derive(Clone, PartialEq)]
pub struct ContentBodyFrame {
    pub channel: Channel,
    pub body: Bytes,
}

impl ContentBodyFrame {
    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::ContentBody(self)
    }
}

impl std::fmt::Debug for ContentBodyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = String::from_utf8_lossy(&self.body[..std::cmp::min(64usize, self.body.len())]);

        f.write_fmt(format_args!(
            "ContentBodyFrame {{ channel: {}, body: \"{}\" }}",
            &self.channel, body
        ))
    }
}

/// Type alias for inner type of field value.
pub type FieldTable = HashMap<String, AMQPFieldValue>;

/// A typed value of a field table or a field array.
#[derive(Clone, Debug, PartialEq)]
pub enum AMQPFieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Scale and unscaled value.
    Decimal(u8, u32),
    LongString(String),
    ByteArray(Vec<u8>),
    FieldArray(Vec<AMQPFieldValue>),
    Timestamp(u64),
    FieldTable(Box<FieldTable>),
    Void,
}

impl From<ContentHeaderFrame> for AMQPFrame {
    fn from(chf: ContentHeaderFrame) -> AMQPFrame {
        AMQPFrame::ContentHeader(chf)
    }
}

impl From<ContentBodyFrame> for AMQPFrame {
    fn from(cbf: ContentBodyFrame) -> AMQPFrame {
        AMQPFrame::ContentBody(cbf)
    }
}

/// Split class id and method id from `u32` combined code.
pub fn split_class_method(cm: u32) -> (u16, u16) {
    let method_id = (cm & 0x0000FFFF) as u16;
    let class_id = (cm >> 16) as u16;

    (class_id, method_id)
}

/// Combine class id and method id to a single `u32` value
pub fn unify_class_method(class: u16, method: u16) -> u32 {
    ((class as u32) << 16) | (method as u32)
}

pub fn heartbeat() -> AMQPFrame {
    AMQPFrame::Heartbeat(0)
}
