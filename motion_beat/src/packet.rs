//! Typed schema for inbound capture messages.
//!
//! Two shapes are recognised:
//!
//! * the **clock** address carries `[hi, lo]`, two unsigned 32-bit words of
//!   a microsecond timestamp;
//! * any other address carries `[count, x0, y0, z0, id0, x1, …]`.
//!
//! Argument lists are validated for length and type before anything is
//! read, so a short packet becomes a [`PacketError`] instead of an index
//! fault.

use rosc::OscType;
use thiserror::Error;

/// Address on which the capture system publishes its frame clock.
pub const DEFAULT_CLOCK_ADDRESS: &str = "/qtm/data";

const FIELDS_PER_BODY: usize = 4;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PacketError {
    #[error("{address}: expected {expected} arguments, got {got}")]
    FieldCount { address: String, expected: usize, got: usize },

    #[error("{address}: argument {index} should be {wanted}, got {found}")]
    FieldType {
        address: String,
        index:   usize,
        wanted:  &'static str,
        found:   String,
    },
}

/// One body as reported in a position packet.
#[derive(Clone, Debug, PartialEq)]
pub struct BodyReport {
    pub position: [f64; 3],
    pub id:       u32,
}

/// A validated inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum CapturePacket {
    Clock { hi: u32, lo: u32 },
    Positions(Vec<BodyReport>),
}

impl CapturePacket {
    /// Decode the arguments of a message received on `address`.
    pub fn decode(address: &str, args: &[OscType], clock_address: &str) -> Result<Self, PacketError> {
        let fields = Fields { address, args };
        if address == clock_address {
            fields.expect_at_least(2)?;
            return Ok(CapturePacket::Clock {
                hi: fields.clock_word(0)?,
                lo: fields.clock_word(1)?,
            });
        }

        fields.expect_at_least(1)?;
        let count = fields.count(0)? as usize;
        fields.expect_at_least(1 + count * FIELDS_PER_BODY)?;

        let bodies = (0..count)
            .map(|i| {
                let base = 1 + i * FIELDS_PER_BODY;
                Ok(BodyReport {
                    position: [
                        fields.number(base)?,
                        fields.number(base + 1)?,
                        fields.number(base + 2)?,
                    ],
                    id: fields.count(base + 3)?,
                })
            })
            .collect::<Result<Vec<_>, PacketError>>()?;
        Ok(CapturePacket::Positions(bodies))
    }

    /// Seconds encoded by a clock packet's two microsecond words.
    pub fn clock_seconds(hi: u32, lo: u32) -> f64 {
        (((hi as u64) << 32) | lo as u64) as f64 * 1e-6
    }
}

// ── argument access ───────────────────────────────────────────────────────

struct Fields<'a> {
    address: &'a str,
    args:    &'a [OscType],
}

impl Fields<'_> {
    fn expect_at_least(&self, expected: usize) -> Result<(), PacketError> {
        if self.args.len() < expected {
            return Err(PacketError::FieldCount {
                address: self.address.to_string(),
                expected,
                got: self.args.len(),
            });
        }
        Ok(())
    }

    fn type_error(&self, index: usize, wanted: &'static str) -> PacketError {
        PacketError::FieldType {
            address: self.address.to_string(),
            index,
            wanted,
            found: format!("{:?}", self.args[index]),
        }
    }

    fn number(&self, index: usize) -> Result<f64, PacketError> {
        match &self.args[index] {
            OscType::Float(v)  => Ok(*v as f64),
            OscType::Double(v) => Ok(*v),
            OscType::Int(v)    => Ok(*v as f64),
            OscType::Long(v)   => Ok(*v as f64),
            _ => Err(self.type_error(index, "a number")),
        }
    }

    /// Non-negative integer (body count, body id).
    fn count(&self, index: usize) -> Result<u32, PacketError> {
        let value = match &self.args[index] {
            OscType::Int(v)  => u32::try_from(*v).ok(),
            OscType::Long(v) => u32::try_from(*v).ok(),
            OscType::Float(v) if v.fract() == 0.0 && *v >= 0.0 && *v <= u32::MAX as f32 => Some(*v as u32),
            OscType::Double(v) if v.fract() == 0.0 && *v >= 0.0 && *v <= u32::MAX as f64 => Some(*v as u32),
            _ => None,
        };
        value.ok_or_else(|| self.type_error(index, "a non-negative integer"))
    }

    /// One 32-bit half of the clock.  OSC has no unsigned int, so an `Int`
    /// is read as its raw bit pattern.
    fn clock_word(&self, index: usize) -> Result<u32, PacketError> {
        match &self.args[index] {
            OscType::Int(v)  => Ok(*v as u32),
            OscType::Long(v) => u32::try_from(*v).map_err(|_| self.type_error(index, "a 32-bit word")),
            _ => Err(self.type_error(index, "a 32-bit word")),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn body(x: f32, y: f32, z: f32, id: i32) -> [OscType; 4] {
        [OscType::Float(x), OscType::Float(y), OscType::Float(z), OscType::Int(id)]
    }

    #[test]
    fn decodes_clock() {
        let p = CapturePacket::decode(
            "/qtm/data",
            &[OscType::Int(1), OscType::Int(-1)],
            DEFAULT_CLOCK_ADDRESS,
        ).unwrap();
        assert_eq!(p, CapturePacket::Clock { hi: 1, lo: u32::MAX });
    }

    #[test]
    fn clock_seconds_joins_words() {
        assert!((CapturePacket::clock_seconds(0, 2_000_000) - 2.0).abs() < 1e-12);
        let t = CapturePacket::clock_seconds(1, 0);
        assert!((t - 4294.967296).abs() < 1e-9);
    }

    #[test]
    fn decodes_positions() {
        let mut args = vec![OscType::Int(2)];
        args.extend(body(1.0, 2.0, 3.0, 10));
        args.extend(body(4.0, 5.0, 6.0, 11));
        let p = CapturePacket::decode("/qtm/3d_no_labels", &args, DEFAULT_CLOCK_ADDRESS).unwrap();
        assert_eq!(p, CapturePacket::Positions(vec![
            BodyReport { position: [1.0, 2.0, 3.0], id: 10 },
            BodyReport { position: [4.0, 5.0, 6.0], id: 11 },
        ]));
    }

    #[test]
    fn empty_position_packet_is_valid() {
        let p = CapturePacket::decode("/qtm/3d", &[OscType::Int(0)], DEFAULT_CLOCK_ADDRESS).unwrap();
        assert_eq!(p, CapturePacket::Positions(vec![]));
    }

    #[test]
    fn short_position_packet_is_malformed() {
        let mut args = vec![OscType::Int(2)];
        args.extend(body(1.0, 2.0, 3.0, 10));
        let err = CapturePacket::decode("/qtm/3d", &args, DEFAULT_CLOCK_ADDRESS).unwrap_err();
        assert_eq!(err, PacketError::FieldCount { address: "/qtm/3d".into(), expected: 9, got: 5 });
    }

    #[test]
    fn short_clock_packet_is_malformed() {
        let err = CapturePacket::decode("/qtm/data", &[OscType::Int(3)], DEFAULT_CLOCK_ADDRESS)
            .unwrap_err();
        assert!(matches!(err, PacketError::FieldCount { expected: 2, got: 1, .. }));
    }

    #[test]
    fn no_arguments_is_malformed() {
        assert!(CapturePacket::decode("/qtm/3d", &[], DEFAULT_CLOCK_ADDRESS).is_err());
    }

    #[test]
    fn string_coordinate_is_rejected() {
        let args = vec![
            OscType::Int(1),
            OscType::String("x".into()), OscType::Float(0.0), OscType::Float(0.0), OscType::Int(1),
        ];
        let err = CapturePacket::decode("/qtm/3d", &args, DEFAULT_CLOCK_ADDRESS).unwrap_err();
        assert!(matches!(err, PacketError::FieldType { index: 1, .. }));
    }

    #[test]
    fn negative_count_is_rejected() {
        let err = CapturePacket::decode("/qtm/3d", &[OscType::Int(-1)], DEFAULT_CLOCK_ADDRESS)
            .unwrap_err();
        assert!(matches!(err, PacketError::FieldType { index: 0, .. }));
    }

    #[test]
    fn custom_clock_address() {
        let p = CapturePacket::decode("/clock", &[OscType::Int(0), OscType::Int(5)], "/clock").unwrap();
        assert_eq!(p, CapturePacket::Clock { hi: 0, lo: 5 });
        // the default clock address is then just another position address
        assert!(CapturePacket::decode("/qtm/data", &[OscType::Int(0), OscType::Int(5)], "/clock").is_ok());
    }
}
