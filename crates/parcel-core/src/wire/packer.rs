//! Packer - callable + 引数をフレーム列に変換する
//!
//! # レイアウト
//! ```text
//! Apply:           [header, callable, arg_0, *arg_0_bufs, .., kwarg_0, *kwarg_0_bufs, ..]
//! Completed/Errored: [header, value, *value_bufs]
//! ```
//!
//! - keyword 引数はキーのソート順（`BTreeMap` の順序）で並びます
//! - callable は buffer 抽出しません（常に 1 フレーム）
//! - どこかで encode に失敗したら、部分的なメッセージは作らずにエラーを返します
//!
//! unpack はヘッダーの `codecs` に書かれた codec だけを使います。推測はしません。

use std::collections::BTreeMap;

use bytes::Bytes;

use super::buffers::{extract, placeholder_count, restore};
use super::header::{Header, MessageKind};
use crate::codec::CodecRegistry;
use crate::domain::{DispatchError, RemoteError, SerializationError, Value};

/// An ordered list of frames; frame 0 is always the header.
pub type PackedMessage = Vec<Bytes>;

/// The decoded contents of an `Apply` message.
#[derive(Debug, Clone, PartialEq)]
pub struct Unpacked {
    pub callable: Value,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

/// Packs and unpacks messages against one codec registry.
#[derive(Debug, Clone, Copy)]
pub struct Packer<'a> {
    codecs: &'a CodecRegistry,
    buffer_threshold: usize,
    item_threshold: usize,
}

impl<'a> Packer<'a> {
    pub fn new(codecs: &'a CodecRegistry, buffer_threshold: usize, item_threshold: usize) -> Self {
        Self {
            codecs,
            buffer_threshold,
            item_threshold,
        }
    }

    pub fn pack(
        &self,
        callable: &Value,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<PackedMessage, DispatchError> {
        if !callable.is_callable() {
            return Err(DispatchError::NotCallable {
                type_name: callable.type_name().to_string(),
            });
        }
        let (callable_codec, callable_bytes) = self
            .codecs
            .encode_best_effort(callable)
            .map_err(DispatchError::UncallableSerialization)?;

        let mut codecs = vec![callable_codec];
        let mut frames = vec![Bytes::from(callable_bytes)];

        for arg in args {
            self.push_object(arg, &mut codecs, &mut frames)?;
        }
        let narg_bufs = frames.len() - 1;

        for value in kwargs.values() {
            self.push_object(value, &mut codecs, &mut frames)?;
        }

        let header = Header {
            kind: MessageKind::Apply,
            nargs: args.len(),
            narg_bufs,
            kw_keys: kwargs.keys().cloned().collect(),
            codecs,
        };

        let mut message = Vec::with_capacity(frames.len() + 1);
        message.push(header.encode()?);
        message.extend(frames);
        Ok(message)
    }

    pub fn unpack(&self, message: &[Bytes]) -> Result<Unpacked, DispatchError> {
        let header = read_header(message)?;
        if header.kind != MessageKind::Apply {
            return Err(malformed(format!("expected Apply, got {:?}", header.kind)));
        }
        let objects = header
            .nargs
            .checked_add(header.kw_keys.len())
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| malformed(format!("argument count {} out of range", header.nargs)))?;
        if header.codecs.len() != objects {
            return Err(malformed(format!(
                "{} codec entries for {} objects",
                header.codecs.len(),
                objects
            )));
        }

        let callable_frame = message
            .get(1)
            .ok_or_else(|| malformed("missing callable frame".to_string()))?;
        let callable = self.decode(&header.codecs[0], callable_frame)?;

        let mut cursor = 2;
        let mut args = Vec::with_capacity(header.nargs);
        for codec in &header.codecs[1..=header.nargs] {
            args.push(self.read_object(codec, message, &mut cursor)?);
        }
        if cursor - 2 != header.narg_bufs {
            return Err(malformed(format!(
                "positional frames: header says {}, found {}",
                header.narg_bufs,
                cursor - 2
            )));
        }

        let mut kwargs = BTreeMap::new();
        for (key, codec) in header.kw_keys.iter().zip(&header.codecs[1 + header.nargs..]) {
            let value = self.read_object(codec, message, &mut cursor)?;
            kwargs.insert(key.clone(), value);
        }

        if cursor != message.len() {
            return Err(malformed(format!(
                "{} unexpected trailing frames",
                message.len() - cursor
            )));
        }

        Ok(Unpacked {
            callable,
            args,
            kwargs,
        })
    }

    /// Pack a return value as a `Completed` result.
    pub fn pack_result(&self, value: &Value) -> Result<PackedMessage, DispatchError> {
        self.pack_single(MessageKind::Completed, value)
    }

    /// Pack a captured failure as an `Errored` result.
    ///
    /// Only the text crosses the wire, so this always uses plain data.
    pub fn pack_error(&self, error: &RemoteError) -> Result<PackedMessage, DispatchError> {
        let payload = Value::Map(BTreeMap::from([
            ("ename".to_string(), Value::from(error.ename.as_str())),
            ("evalue".to_string(), Value::from(error.evalue.as_str())),
        ]));
        self.pack_single(MessageKind::Errored, &payload)
    }

    /// Decode a result message into its kind and carried value.
    pub fn unpack_result(&self, message: &[Bytes]) -> Result<(MessageKind, Value), DispatchError> {
        let header = read_header(message)?;
        if header.kind == MessageKind::Apply || header.nargs != 1 || header.codecs.len() != 1 {
            return Err(malformed("not a single-value result message".to_string()));
        }

        let mut cursor = 1;
        let value = self.read_object(&header.codecs[0], message, &mut cursor)?;
        if cursor != message.len() || cursor - 1 != header.narg_bufs {
            return Err(malformed("result buffer count mismatch".to_string()));
        }
        Ok((header.kind, value))
    }

    /// Decode a result message into the outcome the caller sees.
    pub fn unpack_outcome(&self, message: &[Bytes]) -> Result<Value, DispatchError> {
        match self.unpack_result(message)? {
            (MessageKind::Completed, value) => Ok(value),
            (_, Value::Map(mut fields)) => {
                let mut text = |key: &str| match fields.remove(key) {
                    Some(Value::Str(s)) => s,
                    _ => String::new(),
                };
                let ename = text("ename");
                let evalue = text("evalue");
                Err(DispatchError::Remote(RemoteError::new(ename, evalue)))
            }
            (_, other) => Err(malformed(format!(
                "errored result carries `{}`",
                other.type_name()
            ))),
        }
    }

    fn pack_single(&self, kind: MessageKind, value: &Value) -> Result<PackedMessage, DispatchError> {
        let mut codecs = Vec::with_capacity(1);
        let mut frames = Vec::new();
        self.push_object(value, &mut codecs, &mut frames)?;

        let header = Header {
            kind,
            nargs: 1,
            narg_bufs: frames.len(),
            kw_keys: Vec::new(),
            codecs,
        };
        let mut message = Vec::with_capacity(frames.len() + 1);
        message.push(header.encode()?);
        message.extend(frames);
        Ok(message)
    }

    fn push_object(
        &self,
        value: &Value,
        codecs: &mut Vec<String>,
        frames: &mut Vec<Bytes>,
    ) -> Result<(), DispatchError> {
        if placeholder_count(value) > 0 {
            return Err(SerializationError {
                type_name: value.type_name().to_string(),
                tried: Vec::new(),
                reason: "buffer placeholders are reserved".to_string(),
            }
            .into());
        }

        let extracted = extract(value, self.buffer_threshold, self.item_threshold);
        let (codec, bytes) = self.codecs.encode_best_effort(&extracted.remainder)?;
        codecs.push(codec);
        frames.push(Bytes::from(bytes));
        frames.extend(extracted.buffers);
        Ok(())
    }

    fn read_object(&self, codec: &str, message: &[Bytes], cursor: &mut usize) -> Result<Value, DispatchError> {
        let frame = message
            .get(*cursor)
            .ok_or_else(|| malformed(format!("missing frame {}", *cursor)))?;
        let remainder = self.decode(codec, frame)?;

        let start = *cursor + 1;
        let end = start + placeholder_count(&remainder);
        let buffers = message
            .get(start..end)
            .ok_or_else(|| malformed(format!("expected buffers {start}..{end}, have {}", message.len())))?;
        *cursor = end;
        restore(remainder, buffers)
    }

    fn decode(&self, codec: &str, frame: &[u8]) -> Result<Value, DispatchError> {
        self.codecs
            .decode(codec, frame)
            .map_err(|e| malformed(format!("{codec}: {e}")))
    }
}

fn read_header(message: &[Bytes]) -> Result<Header, DispatchError> {
    let frame = message
        .first()
        .ok_or_else(|| malformed("empty message".to_string()))?;
    Header::decode(frame)
}

fn malformed(reason: String) -> DispatchError {
    DispatchError::Malformed(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JSON, RICH};
    use crate::domain::ResourceHandle;
    use rstest::rstest;

    fn kwargs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[rstest]
    #[case::no_args(vec![], vec![])]
    #[case::plain(vec![Value::Int(21)], vec![])]
    #[case::mixed(
        vec![Value::from("x"), Value::bytes(vec![1u8; 4096])],
        vec![("scale", Value::Float(0.5)), ("blob", Value::bytes(vec![2u8; 2048]))]
    )]
    fn pack_then_unpack_returns_the_inputs(
        #[case] args: Vec<Value>,
        #[case] kw: Vec<(&str, Value)>,
    ) {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 1024, 64);
        let callable = Value::function("f");
        let kw = kwargs(&kw);

        let message = packer.pack(&callable, &args, &kw).unwrap();
        let unpacked = packer.unpack(&message).unwrap();

        assert_eq!(unpacked.callable, callable);
        assert_eq!(unpacked.args, args);
        assert_eq!(unpacked.kwargs, kw);
    }

    #[test]
    fn layout_matches_header_counts() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 8, 64);
        let args = vec![Value::bytes(vec![0u8; 16]), Value::Int(1)];
        let kw = kwargs(&[("z", Value::Int(2)), ("a", Value::bytes(vec![1u8; 9]))]);

        let message = packer.pack(&Value::function("f"), &args, &kw).unwrap();
        let header = Header::decode(&message[0]).unwrap();

        assert_eq!(header.nargs, 2);
        assert_eq!(header.narg_bufs, 3);
        assert_eq!(header.kw_keys, vec!["a", "z"]);
        // header + callable + 3 positional + ("a" + buffer) + "z"
        assert_eq!(message.len(), 1 + 1 + 3 + 2 + 1);
        assert_eq!(&message[3][..], &[0u8; 16][..]);
    }

    #[test]
    fn same_input_packs_identically() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 1024, 64);
        let kw = kwargs(&[("b", Value::Int(1)), ("a", Value::Int(2))]);

        let one = packer.pack(&Value::function("f"), &[Value::Int(1)], &kw).unwrap();
        let two = packer.pack(&Value::function("f"), &[Value::Int(1)], &kw).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn strict_codec_wins_when_both_accept() {
        let codecs = CodecRegistry::permissive();
        let packer = Packer::new(&codecs, 1024, 64);
        let closure = Value::closure("g", [("n", Value::Int(3))]);

        let message = packer
            .pack(&closure, &[Value::Int(1)], &BTreeMap::new())
            .unwrap();
        let header = Header::decode(&message[0]).unwrap();
        assert_eq!(header.codecs, vec![RICH.to_string(), JSON.to_string()]);
    }

    #[test]
    fn uncallable_closure_is_reported_as_such() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 1024, 64);
        let closure = Value::closure("g", [("n", Value::Int(3))]);

        let err = packer.pack(&closure, &[], &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, DispatchError::UncallableSerialization(_)));
    }

    #[test]
    fn unencodable_argument_fails_the_whole_pack() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 1024, 64);
        let args = vec![Value::Int(1), Value::Resource(ResourceHandle::file("/tmp/f"))];

        match packer.pack(&Value::function("f"), &args, &BTreeMap::new()) {
            Err(DispatchError::Serialization(e)) => {
                assert_eq!(e.type_name, "resource<file>");
                assert_eq!(e.tried, vec![JSON.to_string()]);
            }
            other => panic!("expected serialization error, got {other:?}"),
        }
    }

    #[test]
    fn non_callable_is_rejected() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 1024, 64);
        let err = packer
            .pack(&Value::Int(3), &[], &BTreeMap::new())
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::NotCallable {
                type_name: "int".to_string()
            }
        );
    }

    #[test]
    fn missing_buffer_is_malformed() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 8, 64);
        let mut message = packer
            .pack(&Value::function("f"), &[Value::bytes(vec![0u8; 64])], &BTreeMap::new())
            .unwrap();
        message.pop();

        assert!(matches!(
            packer.unpack(&message),
            Err(DispatchError::Malformed(_))
        ));
    }

    #[test]
    fn extra_frame_is_malformed() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 1024, 64);
        let mut message = packer
            .pack(&Value::function("f"), &[Value::Int(1)], &BTreeMap::new())
            .unwrap();
        message.push(Bytes::from_static(b"junk"));

        assert!(matches!(
            packer.unpack(&message),
            Err(DispatchError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_argument_count_is_malformed() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 1024, 64);
        let header = Header {
            kind: MessageKind::Apply,
            nargs: usize::MAX,
            narg_bufs: 0,
            kw_keys: vec!["k".to_string()],
            codecs: vec![],
        };
        let message = vec![header.encode().unwrap(), Bytes::from_static(b"null")];

        assert!(matches!(
            packer.unpack(&message),
            Err(DispatchError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_codec_is_malformed() {
        let sender = CodecRegistry::permissive();
        let receiver = CodecRegistry::strict();
        let closure = Value::closure("g", [("n", Value::Int(3))]);
        let message = Packer::new(&sender, 1024, 64)
            .pack(&closure, &[], &BTreeMap::new())
            .unwrap();

        assert!(matches!(
            Packer::new(&receiver, 1024, 64).unpack(&message),
            Err(DispatchError::Malformed(_))
        ));
    }

    #[test]
    fn results_round_trip_with_buffers() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 8, 64);
        let value = Value::List(vec![Value::Int(1), Value::bytes(vec![5u8; 100])]);

        let message = packer.pack_result(&value).unwrap();
        assert_eq!(message.len(), 3);
        assert_eq!(packer.unpack_outcome(&message).unwrap(), value);
    }

    #[test]
    fn errors_surface_as_remote_errors() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 1024, 64);
        let message = packer
            .pack_error(&RemoteError::new("ZeroDivisionError", "division by zero"))
            .unwrap();

        let (kind, _) = packer.unpack_result(&message).unwrap();
        assert_eq!(kind, MessageKind::Errored);
        assert_eq!(
            packer.unpack_outcome(&message).unwrap_err(),
            DispatchError::Remote(RemoteError::new("ZeroDivisionError", "division by zero"))
        );
    }

    #[test]
    fn apply_message_is_not_a_result() {
        let codecs = CodecRegistry::strict();
        let packer = Packer::new(&codecs, 1024, 64);
        let message = packer
            .pack(&Value::function("f"), &[Value::Int(1)], &BTreeMap::new())
            .unwrap();
        assert!(packer.unpack_result(&message).is_err());
    }
}
