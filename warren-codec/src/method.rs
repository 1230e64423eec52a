//! Method payload and content header codec.
//!
//! The payload of a method frame is the 4 bytes class/method id followed by the arguments. The
//! functions here deal with the arguments only, the class/method prefix is written by the frame
//! codec.
use bytes::{BufMut, BytesMut};

use crate::frame::*;
use crate::wire::*;
use crate::{ProtocolDecodeError, Result};

/// Encode the arguments of a method into a new buffer, sized up front.
pub fn encode(args: &MethodFrameArgs) -> BytesMut {
    let mut buf = BytesMut::with_capacity(required_size(args));

    encode_method(args, &mut buf);

    buf
}

/// Append the encoded arguments of a method to the buffer.
pub fn encode_method(args: &MethodFrameArgs, buf: &mut BytesMut) {
    match args {
        MethodFrameArgs::ConnectionStart(args) => {
            buf.put_u8(args.version_major);
            buf.put_u8(args.version_minor);
            put_field_table(buf, args.properties.as_ref());
            put_long_string(buf, &args.mechanisms);
            put_long_string(buf, &args.locales);
        }
        MethodFrameArgs::ConnectionStartOk(args) => {
            put_field_table(buf, args.properties.as_ref());
            put_short_string(buf, &args.mechanism);
            put_long_string(buf, &args.response);
            put_short_string(buf, &args.locale);
        }
        MethodFrameArgs::ConnectionTune(args) => {
            buf.put_u16(args.channel_max);
            buf.put_u32(args.frame_max);
            buf.put_u16(args.heartbeat);
        }
        MethodFrameArgs::ConnectionTuneOk(args) => {
            buf.put_u16(args.channel_max);
            buf.put_u32(args.frame_max);
            buf.put_u16(args.heartbeat);
        }
        MethodFrameArgs::ConnectionOpen(args) => {
            put_short_string(buf, &args.virtual_host);
            put_short_string(buf, "");
            put_bits(buf, &[args.insist]);
        }
        MethodFrameArgs::ConnectionOpenOk => put_short_string(buf, ""),
        MethodFrameArgs::ConnectionClose(args) => {
            buf.put_u16(args.code);
            put_short_string(buf, &args.text);
            buf.put_u16(args.class_id);
            buf.put_u16(args.method_id);
        }
        MethodFrameArgs::ConnectionBlocked(args) => put_short_string(buf, &args.reason),
        MethodFrameArgs::ChannelOpen => put_short_string(buf, ""),
        MethodFrameArgs::ChannelOpenOk => put_long_string(buf, ""),
        MethodFrameArgs::ChannelFlow(args) | MethodFrameArgs::ChannelFlowOk(args) => put_bits(buf, &[args.active]),
        MethodFrameArgs::ChannelClose(args) => {
            buf.put_u16(args.code);
            put_short_string(buf, &args.text);
            buf.put_u16(args.class_id);
            buf.put_u16(args.method_id);
        }
        MethodFrameArgs::ExchangeDeclare(args) => {
            buf.put_u16(0);
            put_short_string(buf, &args.exchange_name);
            put_short_string(buf, &args.exchange_type);
            buf.put_u8(args.flags.bits());
            put_field_table(buf, args.args.as_ref());
        }
        MethodFrameArgs::ExchangeDelete(args) => {
            buf.put_u16(0);
            put_short_string(buf, &args.exchange_name);
            buf.put_u8(args.flags.bits());
        }
        MethodFrameArgs::QueueDeclare(args) => {
            buf.put_u16(0);
            put_short_string(buf, &args.name);
            buf.put_u8(args.flags.bits());
            put_field_table(buf, args.args.as_ref());
        }
        MethodFrameArgs::QueueDeclareOk(args) => {
            put_short_string(buf, &args.name);
            buf.put_u32(args.message_count);
            buf.put_u32(args.consumer_count);
        }
        MethodFrameArgs::QueueBind(args) => {
            buf.put_u16(0);
            put_short_string(buf, &args.queue_name);
            put_short_string(buf, &args.exchange_name);
            put_short_string(buf, &args.routing_key);
            put_bits(buf, &[args.no_wait]);
            put_field_table(buf, args.args.as_ref());
        }
        MethodFrameArgs::QueuePurge(args) => {
            buf.put_u16(0);
            put_short_string(buf, &args.queue_name);
            put_bits(buf, &[args.no_wait]);
        }
        MethodFrameArgs::QueuePurgeOk(args) => buf.put_u32(args.message_count),
        MethodFrameArgs::QueueDelete(args) => {
            buf.put_u16(0);
            put_short_string(buf, &args.queue_name);
            buf.put_u8(args.flags.bits());
        }
        MethodFrameArgs::QueueDeleteOk(args) => buf.put_u32(args.message_count),
        MethodFrameArgs::QueueUnbind(args) => {
            buf.put_u16(0);
            put_short_string(buf, &args.queue_name);
            put_short_string(buf, &args.exchange_name);
            put_short_string(buf, &args.routing_key);
            put_field_table(buf, args.args.as_ref());
        }
        MethodFrameArgs::BasicQos(args) => {
            buf.put_u32(args.prefetch_size);
            buf.put_u16(args.prefetch_count);
            put_bits(buf, &[args.global]);
        }
        MethodFrameArgs::BasicConsume(args) => {
            buf.put_u16(0);
            put_short_string(buf, &args.queue);
            put_short_string(buf, &args.consumer_tag);
            buf.put_u8(args.flags.bits());
            put_field_table(buf, args.args.as_ref());
        }
        MethodFrameArgs::BasicConsumeOk(args) => put_short_string(buf, &args.consumer_tag),
        MethodFrameArgs::BasicCancel(args) => {
            put_short_string(buf, &args.consumer_tag);
            put_bits(buf, &[args.no_wait]);
        }
        MethodFrameArgs::BasicCancelOk(args) => put_short_string(buf, &args.consumer_tag),
        MethodFrameArgs::BasicPublish(args) => {
            buf.put_u16(0);
            put_short_string(buf, &args.exchange_name);
            put_short_string(buf, &args.routing_key);
            buf.put_u8(args.flags.bits());
        }
        MethodFrameArgs::BasicReturn(args) => {
            buf.put_u16(args.reply_code);
            put_short_string(buf, &args.reply_text);
            put_short_string(buf, &args.exchange_name);
            put_short_string(buf, &args.routing_key);
        }
        MethodFrameArgs::BasicDeliver(args) => {
            put_short_string(buf, &args.consumer_tag);
            buf.put_u64(args.delivery_tag);
            put_bits(buf, &[args.redelivered]);
            put_short_string(buf, &args.exchange_name);
            put_short_string(buf, &args.routing_key);
        }
        MethodFrameArgs::BasicAck(args) => {
            buf.put_u64(args.delivery_tag);
            put_bits(buf, &[args.multiple]);
        }
        MethodFrameArgs::BasicReject(args) => {
            buf.put_u64(args.delivery_tag);
            put_bits(buf, &[args.requeue]);
        }
        MethodFrameArgs::BasicNack(args) => {
            buf.put_u64(args.delivery_tag);
            buf.put_u8(args.flags.bits());
        }
        MethodFrameArgs::ConfirmSelect(args) => put_bits(buf, &[args.no_wait]),
        MethodFrameArgs::ConnectionCloseOk
        | MethodFrameArgs::ConnectionUnblocked
        | MethodFrameArgs::ChannelCloseOk
        | MethodFrameArgs::ExchangeDeclareOk
        | MethodFrameArgs::ExchangeDeleteOk
        | MethodFrameArgs::QueueBindOk
        | MethodFrameArgs::QueueUnbindOk
        | MethodFrameArgs::BasicQosOk
        | MethodFrameArgs::ConfirmSelectOk => (),
    }
}

/// The number of bytes `encode_method` writes for these arguments, computed without encoding.
pub fn required_size(args: &MethodFrameArgs) -> usize {
    match args {
        MethodFrameArgs::ConnectionStart(args) => {
            2 + field_table_size(args.properties.as_ref())
                + long_string_size(&args.mechanisms)
                + long_string_size(&args.locales)
        }
        MethodFrameArgs::ConnectionStartOk(args) => {
            field_table_size(args.properties.as_ref())
                + short_string_size(&args.mechanism)
                + long_string_size(&args.response)
                + short_string_size(&args.locale)
        }
        MethodFrameArgs::ConnectionTune(_) | MethodFrameArgs::ConnectionTuneOk(_) => 8,
        MethodFrameArgs::ConnectionOpen(args) => short_string_size(&args.virtual_host) + 1 + bits_size(1),
        MethodFrameArgs::ConnectionOpenOk => 1,
        MethodFrameArgs::ConnectionClose(args) => 2 + short_string_size(&args.text) + 4,
        MethodFrameArgs::ConnectionBlocked(args) => short_string_size(&args.reason),
        MethodFrameArgs::ChannelOpen => 1,
        MethodFrameArgs::ChannelOpenOk => 4,
        MethodFrameArgs::ChannelFlow(_) | MethodFrameArgs::ChannelFlowOk(_) => bits_size(1),
        MethodFrameArgs::ChannelClose(args) => 2 + short_string_size(&args.text) + 4,
        MethodFrameArgs::ExchangeDeclare(args) => {
            2 + short_string_size(&args.exchange_name)
                + short_string_size(&args.exchange_type)
                + 1
                + field_table_size(args.args.as_ref())
        }
        MethodFrameArgs::ExchangeDelete(args) => 2 + short_string_size(&args.exchange_name) + 1,
        MethodFrameArgs::QueueDeclare(args) => {
            2 + short_string_size(&args.name) + 1 + field_table_size(args.args.as_ref())
        }
        MethodFrameArgs::QueueDeclareOk(args) => short_string_size(&args.name) + 8,
        MethodFrameArgs::QueueBind(args) => {
            2 + short_string_size(&args.queue_name)
                + short_string_size(&args.exchange_name)
                + short_string_size(&args.routing_key)
                + bits_size(1)
                + field_table_size(args.args.as_ref())
        }
        MethodFrameArgs::QueuePurge(args) => 2 + short_string_size(&args.queue_name) + bits_size(1),
        MethodFrameArgs::QueuePurgeOk(_) | MethodFrameArgs::QueueDeleteOk(_) => 4,
        MethodFrameArgs::QueueDelete(args) => 2 + short_string_size(&args.queue_name) + 1,
        MethodFrameArgs::QueueUnbind(args) => {
            2 + short_string_size(&args.queue_name)
                + short_string_size(&args.exchange_name)
                + short_string_size(&args.routing_key)
                + field_table_size(args.args.as_ref())
        }
        MethodFrameArgs::BasicQos(_) => 4 + 2 + bits_size(1),
        MethodFrameArgs::BasicConsume(args) => {
            2 + short_string_size(&args.queue)
                + short_string_size(&args.consumer_tag)
                + 1
                + field_table_size(args.args.as_ref())
        }
        MethodFrameArgs::BasicConsumeOk(args) => short_string_size(&args.consumer_tag),
        MethodFrameArgs::BasicCancel(args) => short_string_size(&args.consumer_tag) + bits_size(1),
        MethodFrameArgs::BasicCancelOk(args) => short_string_size(&args.consumer_tag),
        MethodFrameArgs::BasicPublish(args) => {
            2 + short_string_size(&args.exchange_name) + short_string_size(&args.routing_key) + 1
        }
        MethodFrameArgs::BasicReturn(args) => {
            2 + short_string_size(&args.reply_text)
                + short_string_size(&args.exchange_name)
                + short_string_size(&args.routing_key)
        }
        MethodFrameArgs::BasicDeliver(args) => {
            short_string_size(&args.consumer_tag)
                + 8
                + bits_size(1)
                + short_string_size(&args.exchange_name)
                + short_string_size(&args.routing_key)
        }
        MethodFrameArgs::BasicAck(_) | MethodFrameArgs::BasicReject(_) => 8 + bits_size(1),
        MethodFrameArgs::BasicNack(_) => 8 + 1,
        MethodFrameArgs::ConfirmSelect(_) => bits_size(1),
        MethodFrameArgs::ConnectionCloseOk
        | MethodFrameArgs::ConnectionUnblocked
        | MethodFrameArgs::ChannelCloseOk
        | MethodFrameArgs::ExchangeDeclareOk
        | MethodFrameArgs::ExchangeDeleteOk
        | MethodFrameArgs::QueueBindOk
        | MethodFrameArgs::QueueUnbindOk
        | MethodFrameArgs::BasicQosOk
        | MethodFrameArgs::ConfirmSelectOk => 0,
    }
}

/// The first short string argument which is longer than [`SHORT_STRING_MAX`] bytes. Such a
/// method cannot be encoded without changing the value.
pub fn oversized_short_string(args: &MethodFrameArgs) -> Option<&str> {
    let fields: Vec<&str> = match args {
        MethodFrameArgs::ConnectionStartOk(args) => vec![args.mechanism.as_str(), args.locale.as_str()],
        MethodFrameArgs::ConnectionOpen(args) => vec![args.virtual_host.as_str()],
        MethodFrameArgs::ConnectionClose(args) => vec![args.text.as_str()],
        MethodFrameArgs::ConnectionBlocked(args) => vec![args.reason.as_str()],
        MethodFrameArgs::ChannelClose(args) => vec![args.text.as_str()],
        MethodFrameArgs::ExchangeDeclare(args) => vec![args.exchange_name.as_str(), args.exchange_type.as_str()],
        MethodFrameArgs::ExchangeDelete(args) => vec![args.exchange_name.as_str()],
        MethodFrameArgs::QueueDeclare(args) => vec![args.name.as_str()],
        MethodFrameArgs::QueueDeclareOk(args) => vec![args.name.as_str()],
        MethodFrameArgs::QueueBind(args) => vec![args.queue_name.as_str(), args.exchange_name.as_str(), args.routing_key.as_str()],
        MethodFrameArgs::QueuePurge(args) => vec![args.queue_name.as_str()],
        MethodFrameArgs::QueueDelete(args) => vec![args.queue_name.as_str()],
        MethodFrameArgs::QueueUnbind(args) => vec![args.queue_name.as_str(), args.exchange_name.as_str(), args.routing_key.as_str()],
        MethodFrameArgs::BasicConsume(args) => vec![args.queue.as_str(), args.consumer_tag.as_str()],
        MethodFrameArgs::BasicConsumeOk(args) => vec![args.consumer_tag.as_str()],
        MethodFrameArgs::BasicCancel(args) => vec![args.consumer_tag.as_str()],
        MethodFrameArgs::BasicCancelOk(args) => vec![args.consumer_tag.as_str()],
        MethodFrameArgs::BasicPublish(args) => vec![args.exchange_name.as_str(), args.routing_key.as_str()],
        MethodFrameArgs::BasicReturn(args) => vec![args.reply_text.as_str(), args.exchange_name.as_str(), args.routing_key.as_str()],
        MethodFrameArgs::BasicDeliver(args) => vec![args.consumer_tag.as_str(), args.exchange_name.as_str(), args.routing_key.as_str()],
        _ => vec![],
    };

    fields.into_iter().find(|s| s.len() > SHORT_STRING_MAX)
}

/// Decode the arguments of the method identified by `class_method`.
pub fn decode_method(class_method: ClassMethod, buf: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = match class_method {
        CONNECTION_START => MethodFrameArgs::ConnectionStart(ConnectionStartArgs {
            version_major: get_u8(buf)?,
            version_minor: get_u8(buf)?,
            properties: get_field_table(buf)?,
            mechanisms: get_long_string(buf)?,
            locales: get_long_string(buf)?,
        }),
        CONNECTION_START_OK => MethodFrameArgs::ConnectionStartOk(ConnectionStartOkArgs {
            properties: get_field_table(buf)?,
            mechanism: get_short_string(buf)?,
            response: get_long_string(buf)?,
            locale: get_short_string(buf)?,
        }),
        CONNECTION_TUNE => MethodFrameArgs::ConnectionTune(ConnectionTuneArgs {
            channel_max: get_u16(buf)?,
            frame_max: get_u32(buf)?,
            heartbeat: get_u16(buf)?,
        }),
        CONNECTION_TUNE_OK => MethodFrameArgs::ConnectionTuneOk(ConnectionTuneOkArgs {
            channel_max: get_u16(buf)?,
            frame_max: get_u32(buf)?,
            heartbeat: get_u16(buf)?,
        }),
        CONNECTION_OPEN => {
            let virtual_host = get_short_string(buf)?;
            let _reserved = get_short_string(buf)?;
            let [insist] = get_bits::<1>(buf)?;

            MethodFrameArgs::ConnectionOpen(ConnectionOpenArgs { virtual_host, insist })
        }
        CONNECTION_OPEN_OK => {
            let _reserved = get_short_string(buf)?;

            MethodFrameArgs::ConnectionOpenOk
        }
        CONNECTION_CLOSE => MethodFrameArgs::ConnectionClose(ConnectionCloseArgs {
            code: get_u16(buf)?,
            text: get_short_string(buf)?,
            class_id: get_u16(buf)?,
            method_id: get_u16(buf)?,
        }),
        CONNECTION_CLOSE_OK => MethodFrameArgs::ConnectionCloseOk,
        CONNECTION_BLOCKED => MethodFrameArgs::ConnectionBlocked(ConnectionBlockedArgs {
            reason: get_short_string(buf)?,
        }),
        CONNECTION_UNBLOCKED => MethodFrameArgs::ConnectionUnblocked,
        CHANNEL_OPEN => {
            let _reserved = get_short_string(buf)?;

            MethodFrameArgs::ChannelOpen
        }
        CHANNEL_OPEN_OK => {
            let _reserved = get_long_string(buf)?;

            MethodFrameArgs::ChannelOpenOk
        }
        CHANNEL_FLOW => {
            let [active] = get_bits::<1>(buf)?;

            MethodFrameArgs::ChannelFlow(ChannelFlowArgs { active })
        }
        CHANNEL_FLOW_OK => {
            let [active] = get_bits::<1>(buf)?;

            MethodFrameArgs::ChannelFlowOk(ChannelFlowArgs { active })
        }
        CHANNEL_CLOSE => MethodFrameArgs::ChannelClose(ChannelCloseArgs {
            code: get_u16(buf)?,
            text: get_short_string(buf)?,
            class_id: get_u16(buf)?,
            method_id: get_u16(buf)?,
        }),
        CHANNEL_CLOSE_OK => MethodFrameArgs::ChannelCloseOk,
        EXCHANGE_DECLARE => {
            let _reserved = get_u16(buf)?;

            MethodFrameArgs::ExchangeDeclare(ExchangeDeclareArgs {
                exchange_name: get_short_string(buf)?,
                exchange_type: get_short_string(buf)?,
                flags: ExchangeDeclareFlags::from_bits_truncate(get_u8(buf)?),
                args: get_field_table(buf)?,
            })
        }
        EXCHANGE_DECLARE_OK => MethodFrameArgs::ExchangeDeclareOk,
        EXCHANGE_DELETE => {
            let _reserved = get_u16(buf)?;

            MethodFrameArgs::ExchangeDelete(ExchangeDeleteArgs {
                exchange_name: get_short_string(buf)?,
                flags: ExchangeDeleteFlags::from_bits_truncate(get_u8(buf)?),
            })
        }
        EXCHANGE_DELETE_OK => MethodFrameArgs::ExchangeDeleteOk,
        QUEUE_DECLARE => {
            let _reserved = get_u16(buf)?;

            MethodFrameArgs::QueueDeclare(QueueDeclareArgs {
                name: get_short_string(buf)?,
                flags: QueueDeclareFlags::from_bits_truncate(get_u8(buf)?),
                args: get_field_table(buf)?,
            })
        }
        QUEUE_DECLARE_OK => MethodFrameArgs::QueueDeclareOk(QueueDeclareOkArgs {
            name: get_short_string(buf)?,
            message_count: get_u32(buf)?,
            consumer_count: get_u32(buf)?,
        }),
        QUEUE_BIND => {
            let _reserved = get_u16(buf)?;
            let queue_name = get_short_string(buf)?;
            let exchange_name = get_short_string(buf)?;
            let routing_key = get_short_string(buf)?;
            let [no_wait] = get_bits::<1>(buf)?;

            MethodFrameArgs::QueueBind(QueueBindArgs {
                queue_name,
                exchange_name,
                routing_key,
                no_wait,
                args: get_field_table(buf)?,
            })
        }
        QUEUE_BIND_OK => MethodFrameArgs::QueueBindOk,
        QUEUE_PURGE => {
            let _reserved = get_u16(buf)?;
            let queue_name = get_short_string(buf)?;
            let [no_wait] = get_bits::<1>(buf)?;

            MethodFrameArgs::QueuePurge(QueuePurgeArgs { queue_name, no_wait })
        }
        QUEUE_PURGE_OK => MethodFrameArgs::QueuePurgeOk(QueuePurgeOkArgs {
            message_count: get_u32(buf)?,
        }),
        QUEUE_DELETE => {
            let _reserved = get_u16(buf)?;

            MethodFrameArgs::QueueDelete(QueueDeleteArgs {
                queue_name: get_short_string(buf)?,
                flags: QueueDeleteFlags::from_bits_truncate(get_u8(buf)?),
            })
        }
        QUEUE_DELETE_OK => MethodFrameArgs::QueueDeleteOk(QueueDeleteOkArgs {
            message_count: get_u32(buf)?,
        }),
        QUEUE_UNBIND => {
            let _reserved = get_u16(buf)?;

            MethodFrameArgs::QueueUnbind(QueueUnbindArgs {
                queue_name: get_short_string(buf)?,
                exchange_name: get_short_string(buf)?,
                routing_key: get_short_string(buf)?,
                args: get_field_table(buf)?,
            })
        }
        QUEUE_UNBIND_OK => MethodFrameArgs::QueueUnbindOk,
        BASIC_QOS => {
            let prefetch_size = get_u32(buf)?;
            let prefetch_count = get_u16(buf)?;
            let [global] = get_bits::<1>(buf)?;

            MethodFrameArgs::BasicQos(BasicQosArgs {
                prefetch_size,
                prefetch_count,
                global,
            })
        }
        BASIC_QOS_OK => MethodFrameArgs::BasicQosOk,
        BASIC_CONSUME => {
            let _reserved = get_u16(buf)?;

            MethodFrameArgs::BasicConsume(BasicConsumeArgs {
                queue: get_short_string(buf)?,
                consumer_tag: get_short_string(buf)?,
                flags: BasicConsumeFlags::from_bits_truncate(get_u8(buf)?),
                args: get_field_table(buf)?,
            })
        }
        BASIC_CONSUME_OK => MethodFrameArgs::BasicConsumeOk(BasicConsumeOkArgs {
            consumer_tag: get_short_string(buf)?,
        }),
        BASIC_CANCEL => {
            let consumer_tag = get_short_string(buf)?;
            let [no_wait] = get_bits::<1>(buf)?;

            MethodFrameArgs::BasicCancel(BasicCancelArgs { consumer_tag, no_wait })
        }
        BASIC_CANCEL_OK => MethodFrameArgs::BasicCancelOk(BasicCancelOkArgs {
            consumer_tag: get_short_string(buf)?,
        }),
        BASIC_PUBLISH => {
            let _reserved = get_u16(buf)?;

            MethodFrameArgs::BasicPublish(BasicPublishArgs {
                exchange_name: get_short_string(buf)?,
                routing_key: get_short_string(buf)?,
                flags: BasicPublishFlags::from_bits_truncate(get_u8(buf)?),
            })
        }
        BASIC_RETURN => MethodFrameArgs::BasicReturn(BasicReturnArgs {
            reply_code: get_u16(buf)?,
            reply_text: get_short_string(buf)?,
            exchange_name: get_short_string(buf)?,
            routing_key: get_short_string(buf)?,
        }),
        BASIC_DELIVER => {
            let consumer_tag = get_short_string(buf)?;
            let delivery_tag = get_u64(buf)?;
            let [redelivered] = get_bits::<1>(buf)?;

            MethodFrameArgs::BasicDeliver(BasicDeliverArgs {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange_name: get_short_string(buf)?,
                routing_key: get_short_string(buf)?,
            })
        }
        BASIC_ACK => {
            let delivery_tag = get_u64(buf)?;
            let [multiple] = get_bits::<1>(buf)?;

            MethodFrameArgs::BasicAck(BasicAckArgs { delivery_tag, multiple })
        }
        BASIC_REJECT => {
            let delivery_tag = get_u64(buf)?;
            let [requeue] = get_bits::<1>(buf)?;

            MethodFrameArgs::BasicReject(BasicRejectArgs { delivery_tag, requeue })
        }
        BASIC_NACK => MethodFrameArgs::BasicNack(BasicNackArgs {
            delivery_tag: get_u64(buf)?,
            flags: BasicNackFlags::from_bits_truncate(get_u8(buf)?),
        }),
        CONFIRM_SELECT => {
            let [no_wait] = get_bits::<1>(buf)?;

            MethodFrameArgs::ConfirmSelect(ConfirmSelectArgs { no_wait })
        }
        CONFIRM_SELECT_OK => MethodFrameArgs::ConfirmSelectOk,
        _ => return Err(ProtocolDecodeError::UnknownMethod(class_method)),
    };

    Ok(args)
}

/// Append the payload of a content header frame: class, weight, body size, property flags and
/// the present properties.
pub fn encode_content_header(hf: &ContentHeaderFrame, buf: &mut BytesMut) {
    let props = &hf.properties;

    buf.put_u16(hf.class_id);
    buf.put_u16(hf.weight);
    buf.put_u64(hf.body_size);
    buf.put_u16(props.flags().bits());

    if let Some(ref v) = props.content_type {
        put_short_string(buf, v);
    }
    if let Some(ref v) = props.content_encoding {
        put_short_string(buf, v);
    }
    if let Some(ref v) = props.headers {
        put_field_table(buf, Some(v));
    }
    if let Some(v) = props.delivery_mode {
        buf.put_u8(v);
    }
    if let Some(v) = props.priority {
        buf.put_u8(v);
    }
    if let Some(ref v) = props.correlation_id {
        put_short_string(buf, v);
    }
    if let Some(ref v) = props.reply_to {
        put_short_string(buf, v);
    }
    if let Some(ref v) = props.expiration {
        put_short_string(buf, v);
    }
    if let Some(ref v) = props.message_id {
        put_short_string(buf, v);
    }
    if let Some(v) = props.timestamp {
        buf.put_u64(v);
    }
    if let Some(ref v) = props.message_type {
        put_short_string(buf, v);
    }
    if let Some(ref v) = props.user_id {
        put_short_string(buf, v);
    }
    if let Some(ref v) = props.app_id {
        put_short_string(buf, v);
    }
    if let Some(ref v) = props.cluster_id {
        put_short_string(buf, v);
    }
}

pub fn content_header_size(hf: &ContentHeaderFrame) -> usize {
    let props = &hf.properties;
    let short = |s: &Option<String>| s.as_deref().map(short_string_size).unwrap_or_default();

    14 + short(&props.content_type)
        + short(&props.content_encoding)
        + props.headers.as_ref().map(|t| field_table_size(Some(t))).unwrap_or_default()
        + props.delivery_mode.map(|_| 1).unwrap_or_default()
        + props.priority.map(|_| 1).unwrap_or_default()
        + short(&props.correlation_id)
        + short(&props.reply_to)
        + short(&props.expiration)
        + short(&props.message_id)
        + props.timestamp.map(|_| 8).unwrap_or_default()
        + short(&props.message_type)
        + short(&props.user_id)
        + short(&props.app_id)
        + short(&props.cluster_id)
}

pub fn decode_content_header(channel: Channel, buf: &mut BytesMut) -> Result<ContentHeaderFrame> {
    let class_id = get_u16(buf)?;
    let weight = get_u16(buf)?;
    let body_size = get_u64(buf)?;
    let flags = HeaderPropertyFlags::from_bits_truncate(get_u16(buf)?);

    let short = |buf: &mut BytesMut, flag| -> Result<Option<String>> {
        if flags.contains(flag) {
            Ok(Some(get_short_string(buf)?))
        } else {
            Ok(None)
        }
    };

    let content_type = short(buf, HeaderPropertyFlags::CONTENT_TYPE)?;
    let content_encoding = short(buf, HeaderPropertyFlags::CONTENT_ENCODING)?;
    let headers = if flags.contains(HeaderPropertyFlags::HEADERS) {
        Some(get_field_table(buf)?.unwrap_or_default())
    } else {
        None
    };
    let delivery_mode = if flags.contains(HeaderPropertyFlags::DELIVERY_MODE) {
        Some(get_u8(buf)?)
    } else {
        None
    };
    let priority = if flags.contains(HeaderPropertyFlags::PRIORITY) {
        Some(get_u8(buf)?)
    } else {
        None
    };
    let correlation_id = short(buf, HeaderPropertyFlags::CORRELATION_ID)?;
    let reply_to = short(buf, HeaderPropertyFlags::REPLY_TO)?;
    let expiration = short(buf, HeaderPropertyFlags::EXPIRATION)?;
    let message_id = short(buf, HeaderPropertyFlags::MESSAGE_ID)?;
    let timestamp = if flags.contains(HeaderPropertyFlags::TIMESTAMP) {
        Some(get_u64(buf)?)
    } else {
        None
    };
    let message_type = short(buf, HeaderPropertyFlags::MESSAGE_TYPE)?;
    let user_id = short(buf, HeaderPropertyFlags::USER_ID)?;
    let app_id = short(buf, HeaderPropertyFlags::APP_ID)?;
    let cluster_id = short(buf, HeaderPropertyFlags::CLUSTER_ID)?;

    Ok(ContentHeaderFrame {
        channel,
        class_id,
        weight,
        body_size,
        properties: BasicProperties {
            content_type,
            content_encoding,
            headers,
            delivery_mode,
            priority,
            correlation_id,
            reply_to,
            expiration,
            message_id,
            timestamp,
            message_type,
            user_id,
            app_id,
            cluster_id,
        },
    })
}
