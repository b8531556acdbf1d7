//! The messages exchanged after the handshake.

use crate::blockinfo::{BlockData, BlockInfo};
use crate::Bitfield;

/// The core message set (BEP 3) plus the extension protocol envelope
/// (BEP 10, id 20).
#[derive(Debug, PartialEq)]
#[cfg_attr(test, derive(Clone))]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: usize,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: usize,
        offset: u32,
        data: BlockData,
    },
    Cancel(BlockInfo),
    /// An extension-protocol message: the remote-assigned sub-id and the
    /// raw payload (a bencoded dictionary, possibly followed by binary
    /// trailer data for ut_metadata).
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// The message's wire id, `None` for keep-alives (which have none).
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Block { .. } => Some(MessageId::Block),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Extended { .. } => Some(MessageId::Extended),
        }
    }

}

/// The wire ids of the messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            20 => Ok(Self::Extended),
            other => Err(other),
        }
    }
}
