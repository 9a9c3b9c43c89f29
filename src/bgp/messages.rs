use anyhow::Result;
use byteorder::{BigEndian, WriteBytesExt};
use derive_builder::Builder;
use num_traits::FromPrimitive;
use std::fmt;
use std::io::prelude::*;
use std::io::Cursor;
use std::mem::size_of;
use std::net::IpAddr;

use super::types::*;

/// The OPEN message this FSM sends and the one it parses out of a peer's
/// reply. Optional parameters (capabilities) are carried opaquely — this
/// crate does not interpret AFI/SAFI-specific capability semantics, only
/// forwards the raw bytes it was configured to send and the raw bytes it
/// received.
#[derive(Default, Builder, Debug, Clone, PartialEq)]
#[builder(setter(into))]
pub struct BGPOpenMessage {
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub router_id: u32,
    pub opt_params: Vec<u8>,
}

impl fmt::Display for BGPOpenMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "version: {} asn: {} hold_time: {} router_id: {}",
            self.version,
            self.asn,
            self.hold_time,
            IpAddr::from(std::net::Ipv4Addr::from(self.router_id)),
        )
    }
}

impl From<Vec<u8>> for BGPOpenMessage {
    fn from(src: Vec<u8>) -> Self {
        let mut version = [0u8; 1];
        version.copy_from_slice(&src[0..1]);
        let version = u8::from_be_bytes(version);

        let mut asn = [0u8; 2];
        asn.copy_from_slice(&src[1..3]);
        let asn = u16::from_be_bytes(asn);

        let mut hold = [0u8; 2];
        hold.copy_from_slice(&src[3..5]);
        let hold = u16::from_be_bytes(hold);

        let mut rid = [0u8; 4];
        rid.copy_from_slice(&src[5..9]);
        let rid = u32::from_be_bytes(rid);

        // Optional-parameters length octet at src[9], parameters follow.
        let opt_params = src[10..].to_vec();

        BGPOpenMessageBuilder::default()
            .version(version)
            .asn(asn)
            .hold_time(hold)
            .router_id(rid)
            .opt_params(opt_params)
            .build()
            .unwrap()
    }
}

impl From<BGPOpenMessage> for Vec<u8> {
    fn from(val: BGPOpenMessage) -> Self {
        let mut buf = Cursor::new(vec![]);
        buf.write_u8(val.version).unwrap();
        buf.write_u16::<BigEndian>(val.asn).unwrap();
        buf.write_u16::<BigEndian>(val.hold_time).unwrap();
        buf.write_u32::<BigEndian>(val.router_id).unwrap();
        buf.write_u8(val.opt_params.len() as u8).unwrap();
        buf.write_all(&val.opt_params).unwrap();
        buf.into_inner()
    }
}

impl BGPOpenMessage {
    pub fn byte_len(&self) -> usize {
        10 + self.opt_params.len()
    }

    pub fn new(asn: u16, rid: u32, hold: u16, opt_params: Vec<u8>) -> Result<BGPOpenMessage, String> {
        BGPOpenMessageBuilder::default()
            .version(VERSION)
            .asn(asn)
            .hold_time(hold)
            .router_id(rid)
            .opt_params(opt_params)
            .build()
    }
}

/// UPDATE is carried opaquely: this crate forwards the withdrawn-routes /
/// path-attributes / NLRI bytes to the Routeing Engine unparsed. Decoding
/// them into prefixes and attributes is route-processing, out of scope.
#[derive(Default, Builder, Debug, Clone, PartialEq)]
#[builder(setter(into))]
pub struct BGPUpdateMessage {
    pub body: Vec<u8>,
}

impl BGPUpdateMessage {
    pub fn byte_len(&self) -> usize {
        self.body.len()
    }

    pub fn new(body: Vec<u8>) -> Result<BGPUpdateMessage, String> {
        BGPUpdateMessageBuilder::default().body(body).build()
    }
}

impl From<BGPUpdateMessage> for Vec<u8> {
    fn from(val: BGPUpdateMessage) -> Self {
        val.body
    }
}

impl From<Vec<u8>> for BGPUpdateMessage {
    fn from(src: Vec<u8>) -> Self {
        BGPUpdateMessageBuilder::default()
            .body(src)
            .build()
            .unwrap()
    }
}

#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(setter(into))]
pub struct BGPNotificationMessage {
    pub error_code: ErrorCode,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

impl BGPNotificationMessage {
    pub fn byte_len(&self) -> usize {
        2 + self.data.len()
    }

    pub fn new(code: ErrorCode, sub: u8) -> Result<BGPNotificationMessage, String> {
        BGPNotificationMessageBuilder::default()
            .error_code(code)
            .error_subcode(sub)
            .data(vec![])
            .build()
    }

    pub fn with_data(code: ErrorCode, sub: u8, data: Vec<u8>) -> Result<BGPNotificationMessage, String> {
        BGPNotificationMessageBuilder::default()
            .error_code(code)
            .error_subcode(sub)
            .data(data)
            .build()
    }
}

impl From<Vec<u8>> for BGPNotificationMessage {
    fn from(src: Vec<u8>) -> Self {
        let e: ErrorCode = FromPrimitive::from_u8(src[0]).unwrap_or(ErrorCode::Cease);
        BGPNotificationMessageBuilder::default()
            .error_code(e)
            .error_subcode(src[1])
            .data(src[2..].to_vec())
            .build()
            .unwrap()
    }
}

impl From<BGPNotificationMessage> for Vec<u8> {
    fn from(val: BGPNotificationMessage) -> Self {
        let mut buf = Cursor::new(vec![]);
        buf.write_u8(val.error_code as u8).unwrap();
        buf.write_u8(val.error_subcode).unwrap();
        buf.write_all(&val.data).unwrap();
        buf.into_inner()
    }
}

#[derive(Default, Builder, Debug, Clone, PartialEq)]
#[builder(setter(into))]
pub struct BGPKeepaliveMessage {}

impl BGPKeepaliveMessage {
    pub fn byte_len(&self) -> u16 {
        0
    }

    pub fn new() -> std::result::Result<BGPKeepaliveMessage, String> {
        BGPKeepaliveMessageBuilder::default().build()
    }
}

impl From<BGPKeepaliveMessage> for Vec<u8> {
    fn from(_val: BGPKeepaliveMessage) -> Self {
        vec![]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BGPMessageBody {
    Open(BGPOpenMessage),
    Update(BGPUpdateMessage),
    Notification(BGPNotificationMessage),
    Keepalive(BGPKeepaliveMessage),
}

impl Default for BGPMessageBody {
    fn default() -> Self {
        let msg = BGPKeepaliveMessage::new().unwrap();
        Self::Keepalive(msg)
    }
}

impl From<BGPMessageBody> for Vec<u8> {
    fn from(val: BGPMessageBody) -> Self {
        match val {
            BGPMessageBody::Open(body) => body.into(),
            BGPMessageBody::Update(body) => body.into(),
            BGPMessageBody::Notification(body) => body.into(),
            BGPMessageBody::Keepalive(body) => body.into(),
        }
    }
}

#[derive(Default, Builder, Debug, Clone, PartialEq)]
#[builder(setter(into))]
pub struct BGPMessageHeader {
    pub message_type: MessageType,
}

#[derive(Default, Builder, Debug, Clone, PartialEq)]
#[builder(setter(into))]
pub struct Message {
    pub header: BGPMessageHeader,
    pub body: BGPMessageBody,
}

impl From<Vec<u8>> for Message {
    fn from(src: Vec<u8>) -> Self {
        let mut mtype = [0u8; 1];
        mtype.copy_from_slice(&src[18..19]);
        let mtype = MessageType::from_u8(mtype[0]).unwrap();
        let header = BGPMessageHeaderBuilder::default()
            .message_type(mtype)
            .build()
            .unwrap();
        let srclength = src.len();
        let v = src[19..srclength].to_vec();
        let body = match mtype {
            MessageType::Open => {
                let msg: BGPOpenMessage = v.into();
                BGPMessageBody::Open(msg)
            }
            MessageType::Update => {
                let msg: BGPUpdateMessage = v.into();
                BGPMessageBody::Update(msg)
            }
            MessageType::Notification => {
                let msg: BGPNotificationMessage = v.into();
                BGPMessageBody::Notification(msg)
            }
            MessageType::Keepalive => {
                let msg = BGPKeepaliveMessage::new().unwrap();
                BGPMessageBody::Keepalive(msg)
            }
        };

        MessageBuilder::default()
            .header(header)
            .body(body)
            .build()
            .unwrap()
    }
}

impl From<Message> for Vec<u8> {
    fn from(val: Message) -> Self {
        let mut buf = Cursor::new(vec![]);
        buf.write_u8(val.header.message_type as u8).unwrap();
        let v: Vec<u8> = val.body.into();
        buf.write_all(&v[0..]).unwrap();
        buf.into_inner()
    }
}

impl Message {
    pub fn new(mtype: MessageType, body: BGPMessageBody) -> anyhow::Result<Message> {
        let header = BGPMessageHeaderBuilder::default()
            .message_type(mtype)
            .build()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        MessageBuilder::default()
            .header(header)
            .body(body)
            .build()
            .map_err(|e| anyhow::anyhow!("{}", e))
    }

    pub fn byte_len(&self) -> usize {
        let v: Vec<u8> = self.clone().into();
        MIN_MESSAGE_LENGTH - 1 + v.len()
    }
}
