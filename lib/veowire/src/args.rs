//! Typed argument slots for offloaded calls and the copy descriptors that
//! shuttle indirect argument buffers across the process boundary.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserializer, Serializer};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Transfer direction of an indirect argument buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Intent {
    In = 0,
    InOut = 1,
    Out = 2,
}

impl Intent {
    /// Checked construction from the wire tag.
    pub fn from_tag(tag: u32) -> Option<Intent> {
        match tag {
            0 => Some(Intent::In),
            1 => Some(Intent::InOut),
            2 => Some(Intent::Out),
            _ => None,
        }
    }

    /// True if the buffer contents travel to the worker before the call.
    #[inline]
    pub fn is_in(self) -> bool {
        match self {
            Intent::In | Intent::InOut => true,
            Intent::Out => false,
        }
    }

    /// True if the buffer contents travel back to the host after the call.
    #[inline]
    pub fn is_out(self) -> bool {
        match self {
            Intent::Out | Intent::InOut => true,
            Intent::In => false,
        }
    }
}

impl From<Intent> for u32 {
    #[inline]
    fn from(intent: Intent) -> Self {
        intent as u32
    }
}

/// An indirect argument: `len` bytes at host address `buff`, passed to the
/// callee as a pointer in its slot position. The bytes are supplied from
/// the request's copy-in list and, for out-directed intents, captured into
/// the response's copy-out list.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StackArg {
    pub intent: Intent,
    pub buff: u64,
    pub len: u64,
}

/// A single typed argument slot. The discriminator doubles as the dense
/// wire tag; scalars are passed by value in their declared position.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Arg {
    I64(i64),
    U64(u64),
    I32(i32),
    U32(u32),
    I16(i16),
    U16(u16),
    I8(i8),
    U8(u8),
    Double(f64),
    Float(f32),
    Stack(StackArg),
}

impl Arg {
    /// Dense wire tag of this slot.
    pub fn tag(&self) -> u32 {
        match self {
            Arg::I64(_) => 0,
            Arg::U64(_) => 1,
            Arg::I32(_) => 2,
            Arg::U32(_) => 3,
            Arg::I16(_) => 4,
            Arg::U16(_) => 5,
            Arg::I8(_) => 6,
            Arg::U8(_) => 7,
            Arg::Double(_) => 8,
            Arg::Float(_) => 9,
            Arg::Stack(_) => 10,
        }
    }
}

/// Wire shape of a stack slot's value field.
#[derive(Serialize, Deserialize)]
struct StackVal {
    inout: u32,
    buff: u64,
    len: u64,
}

impl serde::Serialize for Arg {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", &self.tag())?;

        match *self {
            Arg::I64(val) => map.serialize_entry("val", &val)?,
            Arg::U64(val) => map.serialize_entry("val", &val)?,
            Arg::I32(val) => map.serialize_entry("val", &val)?,
            Arg::U32(val) => map.serialize_entry("val", &val)?,
            Arg::I16(val) => map.serialize_entry("val", &val)?,
            Arg::U16(val) => map.serialize_entry("val", &val)?,
            Arg::I8(val) => map.serialize_entry("val", &val)?,
            Arg::U8(val) => map.serialize_entry("val", &val)?,
            Arg::Double(val) => map.serialize_entry("val", &val)?,
            Arg::Float(val) => map.serialize_entry("val", &val)?,
            Arg::Stack(ref arg) => map.serialize_entry(
                "val",
                &StackVal {
                    inout: arg.intent.into(),
                    buff: arg.buff,
                    len: arg.len,
                },
            )?,
        }

        map.end()
    }
}

impl<'de> serde::Deserialize<'de> for Arg {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Arg, D::Error> {
        struct ArgVisitor;

        impl<'de> Visitor<'de> for ArgVisitor {
            type Value = Arg;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a {type, val} argument slot")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Arg, A::Error> {
                match map.next_key::<String>()? {
                    Some(ref key) if key == "type" => (),
                    _ => return Err(de::Error::custom("argument slot must lead with its type tag")),
                }

                let tag: u32 = map.next_value()?;

                match map.next_key::<String>()? {
                    Some(ref key) if key == "val" => (),
                    _ => return Err(de::Error::custom("argument slot is missing its value")),
                }

                let arg = match tag {
                    0 => Arg::I64(map.next_value()?),
                    1 => Arg::U64(map.next_value()?),
                    2 => Arg::I32(map.next_value()?),
                    3 => Arg::U32(map.next_value()?),
                    4 => Arg::I16(map.next_value()?),
                    5 => Arg::U16(map.next_value()?),
                    6 => Arg::I8(map.next_value()?),
                    7 => Arg::U8(map.next_value()?),
                    8 => Arg::Double(map.next_value()?),
                    9 => Arg::Float(map.next_value()?),
                    10 => {
                        let val: StackVal = map.next_value()?;
                        let intent = Intent::from_tag(val.inout)
                            .ok_or_else(|| de::Error::custom("unknown stack argument intent"))?;

                        Arg::Stack(StackArg {
                            intent,
                            buff: val.buff,
                            len: val.len,
                        })
                    }
                    _ => return Err(de::Error::custom("unknown argument type tag")),
                };

                Ok(arg)
            }
        }

        deserializer.deserialize_map(ArgVisitor)
    }
}

/// On-wire record for one buffer shuttle: an opaque worker address, an
/// opaque host address, a length and the bytes themselves. Neither side
/// ever dereferences the other side's address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopyDescriptor {
    pub ve_ptr: u64,
    pub vh_ptr: u64,
    pub len: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(arg: Arg) -> Arg {
        let encoded = rmp_serde::to_vec_named(&arg).unwrap();
        rmp_serde::from_slice(&encoded).unwrap()
    }

    #[test]
    fn test_scalar_roundtrip_all_kinds() {
        let slots = [
            Arg::I64(-1),
            Arg::U64(u64::max_value()),
            Arg::I32(-123),
            Arg::U32(123),
            Arg::I16(-5),
            Arg::U16(5),
            Arg::I8(-2),
            Arg::U8(2),
            Arg::Double(0.5),
            Arg::Float(2.5),
        ];

        for (tag, arg) in slots.iter().enumerate() {
            assert_eq!(arg.tag(), tag as u32);
            assert_eq!(roundtrip(*arg), *arg);
        }
    }

    #[test]
    fn test_stack_roundtrip() {
        let arg = Arg::Stack(StackArg {
            intent: Intent::InOut,
            buff: 0xdead_beef,
            len: 64,
        });

        assert_eq!(arg.tag(), 10);
        assert_eq!(roundtrip(arg), arg);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let encoded = rmp_serde::to_vec_named(&StackVal {
            inout: 0,
            buff: 0,
            len: 0,
        })
        .unwrap();

        // A {inout, buff, len} map is not a valid {type, val} slot.
        let result: Result<Arg, _> = rmp_serde::from_slice(&encoded);

        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_intent_rejected() {
        #[derive(Serialize)]
        struct BadSlot {
            #[serde(rename = "type")]
            tag: u32,
            val: StackVal,
        }

        let encoded = rmp_serde::to_vec_named(&BadSlot {
            tag: 10,
            val: StackVal {
                inout: 9,
                buff: 0,
                len: 0,
            },
        })
        .unwrap();

        let result: Result<Arg, _> = rmp_serde::from_slice(&encoded);

        assert!(result.is_err());
    }

    #[test]
    fn test_intent_direction() {
        assert!(Intent::In.is_in() && !Intent::In.is_out());
        assert!(!Intent::Out.is_in() && Intent::Out.is_out());
        assert!(Intent::InOut.is_in() && Intent::InOut.is_out());
    }
}
