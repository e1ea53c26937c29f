// Frame codec
//
// INTENTION: Serialize and parse the typed wire unit the router exchanges
// with its peers. The codec knows nothing about routing state; it only moves
// header strings and an opaque JSON payload in and out of byte buffers.
//
// Wire layout: `type:u8`, then for each of chain_key, recipient, method and
// sender a `len:u32` (big-endian) followed by that many UTF-8 bytes (len 0
// means absent), then `mtype:u8` (0 = none, 1 = JSON) and, for JSON, another
// length-prefixed byte run. The transport is assumed reliable; there is no
// framing-level checksum.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use qbus_common::{QbusError, Value};

use crate::message::Message;

/// Payload tag: no payload section follows.
pub const MTYPE_NONE: u8 = 0;
/// Payload tag: a length-prefixed JSON document follows.
pub const MTYPE_JSON: u8 = 1;

// Decode hardening; a reliable peer never comes close to these.
const MAX_FIELD_LEN: usize = 64 * 1024;
const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// The five frame types driving the router state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    RouteReq = 1,
    RouteRes = 2,
    RouteUpd = 3,
    MsgReq = 4,
    MsgRes = 5,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<FrameType> {
        match value {
            1 => Some(FrameType::RouteReq),
            2 => Some(FrameType::RouteRes),
            3 => Some(FrameType::RouteUpd),
            4 => Some(FrameType::MsgReq),
            5 => Some(FrameType::MsgRes),
            _ => None,
        }
    }
}

/// The JSON document carried in the payload section. Absent keys are
/// omitted on the wire; an error travels in-band next to the data.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PayloadDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    cdata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    clist: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rinfo: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err_text: Option<String>,
}

impl PayloadDoc {
    fn is_empty(&self) -> bool {
        self.cdata.is_none()
            && self.clist.is_none()
            && self.rinfo.is_none()
            && self.files.is_none()
            && self.err_code.is_none()
            && self.err_text.is_none()
    }
}

/// A typed record on the wire; the lowest unit of routing.
///
/// The payload stays raw JSON bytes: forwarding a frame rewrites header
/// strings in place and never re-serialises the payload. The expensive
/// conversions are [`Frame::to_message`] and [`Frame::set_message_payload`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    ftype: FrameType,
    chain_key: Option<String>,
    module: Option<String>,
    method: Option<String>,
    sender: Option<String>,
    payload: Option<Bytes>,
}

impl Frame {
    pub fn new(
        ftype: FrameType,
        chain_key: Option<String>,
        module: Option<String>,
        method: Option<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            ftype,
            chain_key,
            module,
            method,
            sender: Some(sender.into()),
            payload: None,
        }
    }

    pub fn ftype(&self) -> FrameType {
        self.ftype
    }

    pub fn chain_key(&self) -> Option<&str> {
        self.chain_key.as_deref()
    }

    /// Recipient module, if addressed.
    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Switch the frame type and stamp the local module as sender; used when
    /// a request frame is turned around into its reply in place.
    pub fn set_type(&mut self, ftype: FrameType, sender: impl Into<String>) {
        self.ftype = ftype;
        self.sender = Some(sender.into());
    }

    pub fn set_chain_key(&mut self, chain_key: String) {
        self.chain_key = Some(chain_key);
    }

    pub fn set_sender(&mut self, sender: String) {
        self.sender = Some(sender);
    }

    pub fn set_module(&mut self, module: String) {
        self.module = Some(module);
    }

    pub fn set_method(&mut self, method: String) {
        self.method = Some(method);
    }

    /// Replace the payload with a single serialised value (route frames).
    pub fn set_value_payload(&mut self, value: &Value) -> Result<(), QbusError> {
        let bytes =
            serde_json::to_vec(value).map_err(|err| QbusError::Encode(err.to_string()))?;
        self.payload = Some(Bytes::from(bytes));
        Ok(())
    }

    /// Parse the payload as a single value (route frames).
    pub fn value_payload(&self) -> Option<Value> {
        let bytes = self.payload.as_ref()?;
        serde_json::from_slice(bytes).ok()
    }

    /// Replace the payload with an error-only document.
    pub fn set_error_payload(&mut self, err: &QbusError) -> Result<(), QbusError> {
        let doc = PayloadDoc {
            err_code: Some(err.code()),
            err_text: Some(err.message().to_string()),
            ..PayloadDoc::default()
        };
        let bytes = serde_json::to_vec(&doc).map_err(|e| QbusError::Encode(e.to_string()))?;
        self.payload = Some(Bytes::from(bytes));
        Ok(())
    }

    /// The expensive direction in: move the frame content into a message,
    /// deserialising the payload. The payload leaves the frame.
    pub fn to_message(&mut self) -> Result<Message, QbusError> {
        let doc = match self.payload.take() {
            Some(bytes) => serde_json::from_slice::<PayloadDoc>(&bytes)
                .map_err(|err| QbusError::Malformed(format!("payload: {err}")))?,
            None => PayloadDoc::default(),
        };

        let mut msg = Message::with_chain(
            self.chain_key.clone(),
            self.sender.clone(),
        );
        msg.cdata = doc.cdata.unwrap_or_default();
        msg.clist = doc.clist.unwrap_or_default();
        msg.rinfo = doc.rinfo.unwrap_or_default();
        msg.files = doc.files.unwrap_or_default();
        msg.err = match (doc.err_code, doc.err_text) {
            (Some(code), text) => Some(QbusError::from_wire(code, text.unwrap_or_default())),
            (None, Some(text)) => Some(QbusError::Runtime(text)),
            (None, None) => None,
        };
        Ok(msg)
    }

    /// The expensive direction out: serialise a message into the payload.
    /// Content values move out of the message; `rinfo` and `files` stay with
    /// it. An explicit `err` wins over one already attached to the message.
    pub fn set_message_payload(
        &mut self,
        msg: &mut Message,
        err: Option<&QbusError>,
    ) -> Result<(), QbusError> {
        let err = err.or(msg.err.as_ref());
        let doc = PayloadDoc {
            cdata: (!msg.cdata.is_null()).then(|| msg.cdata.take()),
            clist: (!msg.clist.is_null()).then(|| msg.clist.take()),
            rinfo: (!msg.rinfo.is_null()).then(|| msg.rinfo.take()),
            files: (!msg.files.is_null()).then(|| msg.files.take()),
            err_code: err.map(|e| e.code()),
            err_text: err.map(|e| e.message().to_string()),
        };

        if doc.is_empty() {
            self.payload = None;
            return Ok(());
        }

        let bytes = serde_json::to_vec(&doc).map_err(|e| QbusError::Encode(e.to_string()))?;
        // request info and attachments belong to the message across the call
        if let Some(rinfo) = doc.rinfo {
            msg.rinfo = rinfo;
        }
        if let Some(files) = doc.files {
            msg.files = files;
        }
        self.payload = Some(Bytes::from(bytes));
        Ok(())
    }

    /// Append the wire form of this frame to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.ftype as u8);
        for field in [&self.chain_key, &self.module, &self.method, &self.sender] {
            match field {
                Some(text) => {
                    out.put_u32(text.len() as u32);
                    out.put_slice(text.as_bytes());
                }
                None => out.put_u32(0),
            }
        }
        match &self.payload {
            Some(bytes) => {
                out.put_u8(MTYPE_JSON);
                out.put_u32(bytes.len() as u32);
                out.put_slice(bytes);
            }
            None => out.put_u8(MTYPE_NONE),
        }
    }

    /// Incremental parse from the read buffer. `Ok(None)` means more bytes
    /// are needed; `Err` is a hard error and the caller drops the connection.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, QbusError> {
        let mut pos = 0usize;

        let Some(type_byte) = buf.first().copied() else {
            return Ok(None);
        };
        pos += 1;
        let ftype = FrameType::from_u8(type_byte)
            .ok_or_else(|| QbusError::Malformed(format!("unknown frame type {type_byte}")))?;

        let mut fields: [Option<String>; 4] = [None, None, None, None];
        for slot in &mut fields {
            match read_field(buf, &mut pos)? {
                Some(value) => *slot = value,
                None => return Ok(None),
            }
        }

        if buf.len() < pos + 1 {
            return Ok(None);
        }
        let mtype = buf[pos];
        pos += 1;

        let payload_len = match mtype {
            MTYPE_NONE => None,
            MTYPE_JSON => {
                if buf.len() < pos + 4 {
                    return Ok(None);
                }
                let len = read_u32(buf, pos) as usize;
                pos += 4;
                if len > MAX_PAYLOAD_LEN {
                    return Err(QbusError::Malformed(format!("payload of {len} bytes")));
                }
                if buf.len() < pos + len {
                    return Ok(None);
                }
                Some(len)
            }
            other => return Err(QbusError::Malformed(format!("unknown payload tag {other}"))),
        };

        // the whole frame is in the buffer; consume it
        buf.advance(pos);
        let payload = payload_len.map(|len| buf.split_to(len).freeze());

        let [chain_key, module, method, sender] = fields;
        Ok(Some(Frame {
            ftype,
            chain_key,
            module,
            method,
            sender,
            payload,
        }))
    }
}

fn read_u32(buf: &BytesMut, pos: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_be_bytes(raw)
}

/// One length-prefixed header string. `Ok(None)` = need more bytes;
/// `Ok(Some(None))` = present with length zero, i.e. absent.
fn read_field(
    buf: &BytesMut,
    pos: &mut usize,
) -> Result<Option<Option<String>>, QbusError> {
    if buf.len() < *pos + 4 {
        return Ok(None);
    }
    let len = read_u32(buf, *pos) as usize;
    if len > MAX_FIELD_LEN {
        return Err(QbusError::Malformed(format!("header field of {len} bytes")));
    }
    if buf.len() < *pos + 4 + len {
        return Ok(None);
    }
    let value = if len == 0 {
        None
    } else {
        let raw = buf[*pos + 4..*pos + 4 + len].to_vec();
        Some(
            String::from_utf8(raw)
                .map_err(|_| QbusError::Malformed("header field is not utf-8".into()))?,
        )
    };
    *pos += 4 + len;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut frame = Frame::new(
            FrameType::MsgReq,
            Some("chain-1".into()),
            Some("other".into()),
            Some("echo".into()),
            "self",
        );
        let mut payload = Value::node();
        payload.insert("x", 42i64);
        payload.insert("y", 1.5f64);
        let mut msg = Message::new();
        msg.cdata = payload;
        frame.set_message_payload(&mut msg, None).unwrap();
        frame
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = sample_frame();
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);

        let decoded = Frame::decode(&mut wire).unwrap().unwrap();
        assert!(wire.is_empty());
        assert_eq!(decoded, frame);

        let mut reparse = decoded.clone();
        let mut msg = reparse.to_message().unwrap();
        assert_eq!(msg.cdata.get("x"), Some(&Value::Int(42)));
        assert_eq!(msg.cdata.get("y"), Some(&Value::Float(1.5)));
        assert_eq!(msg.chain_key, "chain-1");
        assert_eq!(msg.sender.as_deref(), Some("self"));
        assert!(msg.err.take().is_none());
    }

    #[test]
    fn decode_is_incremental() {
        let frame = sample_frame();
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);

        let mut partial = BytesMut::new();
        for (i, byte) in wire.iter().enumerate() {
            partial.put_u8(*byte);
            let result = Frame::decode(&mut partial).unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none(), "frame complete after {} bytes", i + 1);
            } else {
                assert_eq!(result.unwrap(), frame);
            }
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let first = sample_frame();
        let mut second = Frame::new(FrameType::RouteReq, None, None, None, "self");
        second
            .set_value_payload(&Value::List(vec![Value::String("a".into())]))
            .unwrap();

        let mut wire = BytesMut::new();
        first.encode(&mut wire);
        second.encode(&mut wire);

        assert_eq!(Frame::decode(&mut wire).unwrap().unwrap(), first);
        assert_eq!(Frame::decode(&mut wire).unwrap().unwrap(), second);
        assert!(wire.is_empty());
    }

    #[test]
    fn unknown_frame_type_is_malformed() {
        let mut wire = BytesMut::new();
        wire.put_u8(99);
        assert!(matches!(
            Frame::decode(&mut wire),
            Err(QbusError::Malformed(_))
        ));
    }

    #[test]
    fn error_payload_round_trips() {
        let mut frame = Frame::new(
            FrameType::MsgRes,
            Some("k".into()),
            None,
            None,
            "self",
        );
        frame
            .set_error_payload(&QbusError::NotFound("method [nope] not found".into()))
            .unwrap();

        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        let mut decoded = Frame::decode(&mut wire).unwrap().unwrap();
        let msg = decoded.to_message().unwrap();
        assert_eq!(
            msg.err,
            Some(QbusError::NotFound("method [nope] not found".into()))
        );
    }

    #[test]
    fn absent_payload_keeps_mtype_none() {
        let frame = Frame::new(FrameType::RouteReq, None, None, None, "self");
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        // type + 4 empty fields + mtype
        assert_eq!(wire.len(), 1 + 4 * 4 + 1);
        assert_eq!(wire[wire.len() - 1], MTYPE_NONE);
    }
}
