//! Pair records: typed transactions whose payload is a named-field tuple
//! described by the out-of-band schema.

use std::fmt::Write as _;

use super::RecordHeader;

/// Display radix for an integer pair field, as declared in the
/// `display_format.dat` sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldFormat {
    #[default]
    Decimal,
    Hex,
    Octal,
}
impl FieldFormat {
    /// Parses a descriptor token. Unknown tokens return `None`.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "DECIMAL" => Some(Self::Decimal),
            "HEX" => Some(Self::Hex),
            "OCTAL" => Some(Self::Octal),
            _ => None,
        }
    }

    /// The descriptor token for this format, as written to
    /// `display_format.dat`.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Decimal => "DECIMAL",
            Self::Hex => "HEX",
            Self::Octal => "OCTAL",
        }
    }

    /// Renders a field value under this radix. Decimal carries no prefix,
    /// hex is prefixed `0x`, octal is prefixed `0`.
    #[must_use]
    pub fn render(self, value: u64) -> String {
        match self {
            Self::Decimal => itoa::Buffer::new().format(value).to_owned(),
            Self::Hex => format!("0x{value:x}"),
            Self::Octal => format!("0{value:o}"),
        }
    }
}

/// A decoded pair record.
///
/// All per-field vectors have equal length; index 0 is always the synthetic
/// `pairid` field carrying the pair type id. `field_values` entries are
/// `(value, is_integer)` - the flag is cleared when the display string came
/// from the string map (a named value) and for `pairid` itself, and the
/// value is [`INVALID_FIELD_VALUE`](super::INVALID_FIELD_VALUE) for
/// embedded-string fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairRecord {
    pub header: RecordHeader,
    pub pair_type_id: u16,
    pub field_names: Vec<String>,
    pub field_sizes: Vec<u16>,
    pub field_values: Vec<(u64, bool)>,
    pub field_strings: Vec<String>,
    pub field_formats: Vec<FieldFormat>,
}
impl PairRecord {
    /// Number of fields, including the synthetic `pairid` at index 0.
    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.field_names.len()
    }

    /// Renders the record as `name(display)` pairs joined by spaces,
    /// skipping the synthetic `pairid` field. Used by the search and dump
    /// tools.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for i in 1..self.num_fields() {
            if i > 1 {
                out.push(' ');
            }
            let _ = write!(out, "{}({})", self.field_names[i], self.field_strings[i]);
        }
        out
    }
}
