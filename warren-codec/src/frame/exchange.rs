use super::{AMQPFrame, Channel, FieldTable, MethodFrameArgs};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct ExchangeDeclareFlags: u8 {
        const PASSIVE = 0b00000001;
        const DURABLE = 0b00000010;
        const AUTO_DELETE = 0b00000100;
        const INTERNAL = 0b00001000;
        const NO_WAIT = 0b00010000;
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExchangeDeclareArgs {
    pub exchange_name: String,
    pub exchange_type: String,
    pub flags: ExchangeDeclareFlags,
    pub args: Option<FieldTable>,
}

impl ExchangeDeclareArgs {
    pub fn new(exchange_name: &str, exchange_type: &str) -> Self {
        Self {
            exchange_name: exchange_name.to_string(),
            exchange_type: exchange_type.to_string(),
            ..Default::default()
        }
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::AUTO_DELETE, mode);
        self
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::DURABLE, mode);
        self
    }

    pub fn internal(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::INTERNAL, mode);
        self
    }

    pub fn passive(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::PASSIVE, mode);
        self
    }

    pub fn args(mut self, args: FieldTable) -> Self {
        self.args = Some(args);
        self
    }

    pub fn is_passive(&self) -> bool {
        self.flags.contains(ExchangeDeclareFlags::PASSIVE)
    }

    pub fn frame(self, channel: Channel) -> AMQPFrame {
        AMQPFrame::Method(channel, super::EXCHANGE_DECLARE, MethodFrameArgs::ExchangeDeclare(self))
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct ExchangeDeleteFlags: u8 {
        const IF_UNUSED = 0b00000001;
        const NO_WAIT = 0b00000010;
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExchangeDeleteArgs {
    pub exchange_name: String,
    pub flags: ExchangeDeleteFlags,
}

impl ExchangeDeleteArgs {
    pub fn new(exchange_name: &str) -> Self {
        Self {
            exchange_name: exchange_name.to_string(),
            ..Default::default()
        }
    }

    pub fn if_unused(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeleteFlags::IF_UNUSED, mode);
        self
    }

    pub fn frame(self, channel: Channel) -> AMQPFrame {
        AMQPFrame::Method(channel, super::EXCHANGE_DELETE, MethodFrameArgs::ExchangeDelete(self))
    }
}

pub fn exchange_declare_ok(channel: Channel) -> AMQPFrame {
    AMQPFrame::Method(channel, super::EXCHANGE_DECLARE_OK, MethodFrameArgs::ExchangeDeclareOk)
}

pub fn exchange_delete_ok(channel: Channel) -> AMQPFrame {
    AMQPFrame::Method(channel, super::EXCHANGE_DELETE_OK, MethodFrameArgs::ExchangeDeleteOk)
}
