//! The out-of-band schema: three in-memory tables built once at open from
//! the four colon-delimited sidecar files.
//!
//! * `map.dat` - `location_id:pair_type_id`, one line per location.
//! * `data.dat` - `pair_type_id:field_count:(name:size:type)*`, one line
//!   per pair type. A synthetic `pairid` field (2 bytes, integer, decimal)
//!   is prepended to every schema, so the stored field count is
//!   `field_count + 1`.
//! * `display_format.dat` - `pair_type_id:fmt_1:fmt_2:…`.
//! * `string_map.dat` - `pair_type_id:field_ordinal:integer_value:display`.
//!   Ordinals index the user-declared field list, without the synthetic
//!   `pairid`.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, SchemaError};
use crate::record::FieldFormat;
use crate::stream::read_descriptor_lines;

pub const MAP_FILE: &str = "map.dat";
pub const DATA_FILE: &str = "data.dat";
pub const DISPLAY_FORMAT_FILE: &str = "display_format.dat";
pub const STRING_MAP_FILE: &str = "string_map.dat";

/// Field type tag: little-endian integer of the declared byte size.
pub const FIELD_TYPE_INT: u16 = 0;
/// Field type tag: embedded length-prefixed string.
pub const FIELD_TYPE_STRING: u16 = 1;

/// Per-pair-type field descriptor. All vectors have equal length and
/// include the synthetic `pairid` field at index 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSchema {
    pub pair_type_id: u16,
    pub names: Vec<String>,
    pub sizes: Vec<u16>,
    pub types: Vec<u16>,
    pub formats: Vec<FieldFormat>,
}
impl PairSchema {
    /// Number of fields, including the synthetic `pairid`.
    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.names.len()
    }
}

/// The resolved schema tables. Read-only after construction; safe to share
/// between threads.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    location_to_pair_type: HashMap<u16, u16>,
    pair_schemas: HashMap<u16, PairSchema>,
    string_map: HashMap<(u16, u16, u64), String>,
    num_locations: usize,
}
impl Schema {
    /// Loads all four sidecars for the database at `prefix`.
    pub fn load(prefix: &str) -> Result<Self> {
        let mut schema = Self::default();
        schema.load_location_map(&format!("{prefix}{MAP_FILE}"))?;
        schema.load_pair_schemas(&format!("{prefix}{DATA_FILE}"))?;
        schema.load_display_formats(&format!("{prefix}{DISPLAY_FORMAT_FILE}"))?;
        schema.load_string_map(&format!("{prefix}{STRING_MAP_FILE}"))?;
        Ok(schema)
    }

    fn malformed(path: &str, line: usize) -> SchemaError {
        SchemaError::MalformedLine {
            file: Path::new(path)
                .file_name()
                .map_or_else(|| path.to_owned(), |n| n.to_string_lossy().into_owned()),
            line,
        }
    }

    fn load_location_map(&mut self, path: &str) -> Result<()> {
        for (lineno, tokens) in read_descriptor_lines(path)?.iter().enumerate() {
            let err = || Self::malformed(path, lineno + 1);
            let [loc, pair_type] = tokens.as_slice() else {
                return Err(err().into());
            };
            let loc: u16 = loc.parse().map_err(|_| err())?;
            let pair_type: u16 = pair_type.parse().map_err(|_| err())?;
            self.location_to_pair_type.insert(loc, pair_type);
            self.num_locations = self.num_locations.max(loc as usize + 1);
        }
        Ok(())
    }

    fn load_pair_schemas(&mut self, path: &str) -> Result<()> {
        for (lineno, tokens) in read_descriptor_lines(path)?.iter().enumerate() {
            let err = || Self::malformed(path, lineno + 1);
            if tokens.len() < 2 {
                return Err(err().into());
            }
            let pair_type_id: u16 = tokens[0].parse().map_err(|_| err())?;
            let field_count: usize = tokens[1].parse().map_err(|_| err())?;
            if tokens.len() != 2 + 3 * field_count {
                return Err(err().into());
            }

            // Synthetic pairid field at index 0.
            let mut names = vec!["pairid".to_owned()];
            let mut sizes = vec![2u16];
            let mut types = vec![FIELD_TYPE_INT];
            for triplet in tokens[2..].chunks_exact(3) {
                let name = triplet[0].clone();
                let size: u16 = triplet[1].parse().map_err(|_| err())?;
                let ty: u16 = triplet[2].parse().map_err(|_| err())?;
                if ty == FIELD_TYPE_INT && size > 8 {
                    return Err(SchemaError::FieldTooWide {
                        pair_type: pair_type_id,
                        name,
                        size,
                    }
                    .into());
                }
                names.push(name);
                sizes.push(size);
                types.push(ty);
            }
            let formats = vec![FieldFormat::Decimal; names.len()];
            self.pair_schemas.insert(
                pair_type_id,
                PairSchema {
                    pair_type_id,
                    names,
                    sizes,
                    types,
                    formats,
                },
            );
        }
        Ok(())
    }

    fn load_display_formats(&mut self, path: &str) -> Result<()> {
        for (lineno, tokens) in read_descriptor_lines(path)?.iter().enumerate() {
            let err = || Self::malformed(path, lineno + 1);
            // A pair type with no user fields legitimately carries a bare id.
            let pair_type_id: u16 = tokens[0].parse().map_err(|_| err())?;
            let Some(schema) = self.pair_schemas.get_mut(&pair_type_id) else {
                return Err(SchemaError::UnknownPairType(pair_type_id).into());
            };
            // Formats align with the user-declared fields; pairid stays decimal.
            for (i, token) in tokens[1..].iter().enumerate() {
                let format = FieldFormat::parse(token).ok_or_else(err)?;
                if let Some(slot) = schema.formats.get_mut(i + 1) {
                    *slot = format;
                }
            }
        }
        Ok(())
    }

    fn load_string_map(&mut self, path: &str) -> Result<()> {
        for (lineno, tokens) in read_descriptor_lines(path)?.iter().enumerate() {
            let err = || Self::malformed(path, lineno + 1);
            if tokens.len() < 4 {
                return Err(err().into());
            }
            let pair_type_id: u16 = tokens[0].parse().map_err(|_| err())?;
            let ordinal: u16 = tokens[1].parse().map_err(|_| err())?;
            let value: u64 = tokens[2].parse().map_err(|_| err())?;
            // The display text may itself contain colons.
            let display = tokens[3..].join(":");
            self.string_map
                .insert((pair_type_id, ordinal, value), display);
        }
        Ok(())
    }

    /// Resolves a location id to its pair type id.
    pub fn pair_type_of(&self, location_id: u16) -> Result<u16> {
        self.location_to_pair_type
            .get(&location_id)
            .copied()
            .ok_or_else(|| SchemaError::UnknownLocation(location_id).into())
    }

    /// The field descriptor for a pair type.
    pub fn pair_schema(&self, pair_type_id: u16) -> Result<&PairSchema> {
        self.pair_schemas
            .get(&pair_type_id)
            .ok_or_else(|| SchemaError::UnknownPairType(pair_type_id).into())
    }

    /// String-map lookup. `ordinal` indexes the user-declared field list.
    #[must_use]
    pub fn lookup_string(&self, pair_type_id: u16, ordinal: u16, value: u64) -> Option<&str> {
        self.string_map
            .get(&(pair_type_id, ordinal, value))
            .map(String::as_str)
    }

    /// One past the highest mapped location id; the width of the windowed
    /// cache's per-tick slot arrays.
    #[must_use]
    pub fn num_locations(&self) -> usize {
        self.num_locations
    }
}
