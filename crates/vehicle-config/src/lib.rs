// This is a library for reading and editing head-unit vehicle configuration
// blobs (VehicleConfig.bin).
//
// FILE FORMAT NOTES
// 1. The blob is a flat, fixed-size byte array. There is no header.
// 2. The last byte is a CRC-8 of everything before it.
// 3. Every setting is a bit field inside a single byte; fields never span
//    bytes. A companion JSON "map file" names the fields and carries the
//    expected blob size and project code, so the blob itself stays opaque
//    without the map.
//
// Field values travel through the public API as bitstrings ("101" means
// bit high=1, middle=0, low=1), which is also how they appear on the vce
// command line. The reserved AAA field holds the project code and can be
// read but never written.

use itertools::Itertools;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde::Deserialize;
use simple_error::bail;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the reserved project-code entry in the map file
/// (`ro.vehicle.config.AAA`). Read-only for editing purposes.
pub const PROJECT_CODE_PROPERTY: &str = "AAA";

/// Computes the checksum stored in the final byte of a config blob.
///
/// The register is 16 bits wide. Each input byte is XORed into the top half
/// and shifted out over 8 rounds; whenever bit 15 is set, the register is
/// XORed with 0x8380 first. That XOR clears bit 15 before every shift, so
/// the register never grows past 16 bits and the top byte after the last
/// round is the checksum.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u16 = 0;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc ^= 0x8380;
            }
            crc <<= 1;
        }
    }
    (crc >> 8) as u8
}


lazy_static! {
    /// The `"[byte][high:low]"` position grammar used by map files.
    static ref POSITION_RE: Regex = Regex::new(r"^\[(\d+)\]\[(\d+):(\d+)\]$").unwrap();
}

/// A bit-field coordinate inside the config blob.
///
/// The text form is `"[byte_idx][high:low]"`, e.g. `"[3][6:2]"` for bits 6
/// down to 2 of byte 3. Bits are numbered 0 (LSB) to 7 (MSB) and a field
/// never spans bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Position {
    pub byte_idx: usize,
    pub high_bit: u8,
    pub low_bit: u8,
}

impl Position {
    /// Parses the map file's text form.
    pub fn parse(pos: &str) -> Result<Position, Box<dyn Error>> {
        let caps = match POSITION_RE.captures(pos) {
            Some(caps) => caps,
            None => {
                bail!(format!("Invalid position format: {}", pos));
            }
        };
        let byte_idx: usize = caps[1].parse()?;
        let high_bit: u32 = caps[2].parse()?;
        let low_bit: u32 = caps[3].parse()?;
        if high_bit > 7 {
            bail!(format!("High bit {} should be in range [0...7]", high_bit));
        }
        if low_bit > 7 {
            bail!(format!("Low bit {} should be in range [0...7]", low_bit));
        }
        if low_bit > high_bit {
            bail!(format!(
                "Low bit {} should not be above high bit {}",
                low_bit, high_bit
            ));
        }
        Ok(Position {
            byte_idx,
            high_bit: high_bit as u8,
            low_bit: low_bit as u8,
        })
    }

    /// Field width in bits, 1..=8.
    pub fn width(&self) -> usize {
        (self.high_bit - self.low_bit + 1) as usize
    }

    /// Right-aligned mask of width() one-bits.
    fn mask(&self) -> u8 {
        // Computed in u16 because a full-byte field would shift 1u8 by 8.
        ((1u16 << self.width()) - 1) as u8
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}][{}:{}]", self.byte_idx, self.high_bit, self.low_bit)
    }
}

/// Reads the field at `pos` as an MSB-first bitstring of exactly
/// `pos.width()` characters.
pub fn read_bits(data: &[u8], pos: &Position) -> String {
    let value = (data[pos.byte_idx] >> pos.low_bit) & pos.mask();
    format!("{:0width$b}", value, width = pos.width())
}

/// Overwrites the field at `pos` with `bits`, leaving the rest of the byte
/// untouched.
///
/// `bits` must be exactly `pos.width()` characters of `0`/`1`.
pub fn write_bits(data: &mut [u8], pos: &Position, bits: &str) -> Result<(), Box<dyn Error>> {
    if bits.len() != pos.width() {
        bail!(format!(
            "Bitstring length {} is not equal to expected {}",
            bits.len(),
            pos.width()
        ));
    }
    if !bits.bytes().all(|c| c == b'0' || c == b'1') {
        bail!(format!("Bitstring {} should contain only 0 and 1", bits));
    }
    let value = u8::from_str_radix(bits, 2)?;
    let cleared = data[pos.byte_idx] & !(pos.mask() << pos.low_bit);
    data[pos.byte_idx] = cleared | (value << pos.low_bit);
    Ok(())
}

#[cfg(test)]
mod position_tests {
    use super::*;

    #[test]
    fn parses_valid_positions() {
        let pos = Position::parse("[3][6:2]").unwrap();
        assert_eq!(3, pos.byte_idx);
        assert_eq!(6, pos.high_bit);
        assert_eq!(2, pos.low_bit);
        assert_eq!(5, pos.width());

        // Single-bit and full-byte fields.
        assert_eq!(1, Position::parse("[0][7:7]").unwrap().width());
        assert_eq!(8, Position::parse("[12][7:0]").unwrap().width());
    }

    #[test]
    fn rejects_malformed_text() {
        for bad in ["", "3:6:2", "[3][6:2", "[3](6:2)", "[a][6:2]", "[3][6:2] "] {
            assert!(Position::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn rejects_bad_bit_ranges() {
        assert!(Position::parse("[0][8:0]").is_err());
        assert!(Position::parse("[0][7:9]").is_err());
        assert!(Position::parse("[0][2:5]").is_err());
    }

    #[test]
    fn displays_round_trip() {
        let pos = Position::parse("[10][5:1]").unwrap();
        assert_eq!("[10][5:1]", pos.to_string());
    }

    #[test]
    fn reads_fields() {
        let data = [0b0110_0101, 0xab];
        assert_eq!("101", read_bits(&data, &Position::parse("[0][2:0]").unwrap()));
        assert_eq!("110", read_bits(&data, &Position::parse("[0][6:4]").unwrap()));
        assert_eq!("0", read_bits(&data, &Position::parse("[0][7:7]").unwrap()));
        assert_eq!(
            "10101011",
            read_bits(&data, &Position::parse("[1][7:0]").unwrap())
        );
    }

    #[test]
    fn writes_fields_without_touching_neighbors() {
        let mut data = [0xff, 0x00];
        write_bits(&mut data, &Position::parse("[0][3:2]").unwrap(), "00").unwrap();
        assert_eq!(0b1111_0011, data[0]);
        write_bits(&mut data, &Position::parse("[1][7:0]").unwrap(), "10101011").unwrap();
        assert_eq!(0xab, data[1]);
    }

    #[test]
    fn write_rejects_bad_bitstrings() {
        let mut data = [0x00];
        let pos = Position::parse("[0][3:0]").unwrap();
        // Wrong width, both directions.
        assert!(write_bits(&mut data, &pos, "101").is_err());
        assert!(write_bits(&mut data, &pos, "10111").is_err());
        // Non-binary characters.
        assert!(write_bits(&mut data, &pos, "10a1").is_err());
        assert!(write_bits(&mut data, &pos, "102-").is_err());
        // Nothing was modified by the failed attempts.
        assert_eq!(0x00, data[0]);
    }
}

/// Serde image of the map file. Position strings are parsed when the map is
/// loaded so a bad map fails before any blob is touched. Unknown top-level
/// keys are tolerated.
#[derive(Debug, Deserialize)]
struct RawMap {
    size: usize,
    project_code: u32,
    #[serde(rename = "ro.vehicle.config")]
    properties: HashMap<String, String>,
}

/// The property map: everything vce knows about a blob's layout.
#[derive(Debug)]
pub struct ConfigMap {
    /// Exact blob size in bytes, trailing CRC byte included.
    pub size: usize,

    /// Expected value of the project-code field.
    pub project_code: u32,

    /// Property name -> field position.
    positions: HashMap<String, Position>,
}

impl ConfigMap {
    /// Loads and validates the map file at `path` (UTF-8 JSON).
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<ConfigMap, Box<dyn Error>> {
        let text = fs::read_to_string(path.as_ref())?;
        debug!("Read map file {}", path.as_ref().display());
        ConfigMap::from_json(&text)
    }

    /// Builds a map from a JSON document.
    pub fn from_json(text: &str) -> Result<ConfigMap, Box<dyn Error>> {
        let raw: RawMap = serde_json::from_str(text)?;
        if raw.size < 2 {
            bail!(format!(
                "Config size {} leaves no room for data and CRC",
                raw.size
            ));
        }
        let mut positions = HashMap::new();
        for (name, pos) in &raw.properties {
            match Position::parse(pos) {
                Ok(parsed) => {
                    positions.insert(name.clone(), parsed);
                }
                Err(e) => {
                    bail!(format!("Property {}: {}", name, e));
                }
            }
        }
        if !positions.contains_key(PROJECT_CODE_PROPERTY) {
            bail!(format!(
                "Map has no {} entry to check the project code against",
                PROJECT_CODE_PROPERTY
            ));
        }
        info!(
            "Map: {} properties, {} byte config, project code {}",
            positions.len(),
            raw.size,
            raw.project_code
        );
        Ok(ConfigMap {
            size: raw.size,
            project_code: raw.project_code,
            positions,
        })
    }

    /// Returns the position mapped for `name`, if any.
    pub fn position(&self, name: &str) -> Option<&Position> {
        self.positions.get(name)
    }

    /// Number of mapped properties.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns whether the map has no properties.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Iterates `(name, position)` entries sorted by property name, for
    /// stable reporting.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Position)> {
        self.positions
            .iter()
            .sorted_by(|a, b| a.0.cmp(b.0))
    }
}


/// One in-memory vehicle configuration blob.
///
/// Construction validates the bytes against a [`ConfigMap`]; afterwards the
/// blob can be read and edited field by field, resealed, and written out.
#[derive(Debug)]
pub struct VehicleConfig {
    /// The filesystem path used to access the file, empty for in-memory blobs.
    path: PathBuf,

    /// The raw bytes, trailing CRC byte included.
    data: Vec<u8>,
}

impl VehicleConfig {
    /// Reads the blob at `path` and validates it against `map`.
    pub fn from_path<P: AsRef<Path>>(path: P, map: &ConfigMap) -> Result<VehicleConfig, Box<dyn Error>> {
        let data = fs::read(path.as_ref())?;
        debug!(
            "Read {} config bytes from {}",
            data.len(),
            path.as_ref().display()
        );
        let config = VehicleConfig {
            path: PathBuf::from(path.as_ref()),
            data,
        };
        config.validate(map)?;
        Ok(config)
    }

    /// Wraps raw bytes, validating them against `map`.
    pub fn from_bytes(data: Vec<u8>, map: &ConfigMap) -> Result<VehicleConfig, Box<dyn Error>> {
        let config = VehicleConfig {
            path: PathBuf::new(),
            data,
        };
        config.validate(map)?;
        Ok(config)
    }

    /// Checks blob invariants: exact size, every mapped field below the CRC
    /// byte, and a matching project code. A stale stored CRC is only warned
    /// about so a hand-damaged blob can still be repaired by editing it.
    fn validate(&self, map: &ConfigMap) -> Result<(), Box<dyn Error>> {
        if self.data.is_empty() || self.data.len() != map.size {
            bail!(format!(
                "Config size should be {} but is {}",
                map.size,
                self.data.len()
            ));
        }
        for (name, pos) in map.entries() {
            // Last byte is CRC.
            if pos.byte_idx >= self.data.len() - 1 {
                bail!(format!(
                    "Property {} has invalid byte index {}",
                    name, pos.byte_idx
                ));
            }
        }

        let aaa = match map.position(PROJECT_CODE_PROPERTY) {
            Some(pos) => pos,
            None => {
                bail!(format!("Map has no {} entry", PROJECT_CODE_PROPERTY));
            }
        };
        let bits = read_bits(&self.data, aaa);
        let actual = u32::from_str_radix(&bits, 2)?;
        if actual != map.project_code {
            bail!(format!(
                "Unsupported project code: expected {}, got {}",
                map.project_code, actual
            ));
        }

        let stored = self.data[self.data.len() - 1];
        let computed = crc8(&self.data[..self.data.len() - 1]);
        if stored != computed {
            warn!(
                "Stored CRC 0x{:02x} does not match computed 0x{:02x}; editing will reseal it",
                stored, computed
            );
        }
        Ok(())
    }

    /// Bitstring value of the field mapped for `name`.
    pub fn get(&self, map: &ConfigMap, name: &str) -> Result<String, Box<dyn Error>> {
        match map.position(name) {
            Some(pos) => Ok(read_bits(&self.data, pos)),
            None => {
                bail!(format!("Property '{}' not found in map", name));
            }
        }
    }

    /// Overwrites the field mapped for `name` with `bits`.
    ///
    /// The project-code field is read-only.
    pub fn set(&mut self, map: &ConfigMap, name: &str, bits: &str) -> Result<(), Box<dyn Error>> {
        if name == PROJECT_CODE_PROPERTY {
            bail!("Project code change is not supported");
        }
        let pos = match map.position(name) {
            Some(pos) => *pos,
            None => {
                bail!(format!("Property '{}' not found in map", name));
            }
        };
        write_bits(&mut self.data, &pos, bits)?;
        debug!("Set {} = {} at {}", name, bits, pos);
        Ok(())
    }

    /// Recomputes the trailing CRC byte from the current contents.
    pub fn seal(&mut self) {
        let last = self.data.len() - 1;
        self.data[last] = crc8(&self.data[..last]);
    }

    /// Writes the blob to `path`.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        fs::write(path.as_ref(), &self.data)?;
        info!(
            "Wrote {} bytes to {}",
            self.data.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// The raw bytes, trailing CRC included.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Pairs the blob with its map for printing.
    pub fn report<'a>(&'a self, map: &'a ConfigMap) -> ConfigReport<'a> {
        ConfigReport { map, config: self }
    }
}

/// Printable view of a blob. `{}` prints a summary; `{:+}` adds the decoded
/// property table.
pub struct ConfigReport<'a> {
    map: &'a ConfigMap,
    config: &'a VehicleConfig,
}

impl fmt::Display for ConfigReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let print_table = f.sign_plus();
        let data = &self.config.data;
        writeln!(f, "VehicleConfig: {}", self.config.path.display())?;
        writeln!(
            f,
            "    size {} bytes; {} mapped properties; project code {}",
            data.len(),
            self.map.len(),
            self.map.project_code
        )?;
        let stored = data[data.len() - 1];
        let computed = crc8(&data[..data.len() - 1]);
        writeln!(
            f,
            "    crc: stored 0x{:02x}, computed 0x{:02x}{}",
            stored,
            computed,
            if stored == computed { "" } else { "  (MISMATCH)" }
        )?;
        if print_table {
            writeln!(f, "Properties:")?;
            for (name, pos) in self.map.entries() {
                let bits = read_bits(data, pos);
                let value = u8::from_str_radix(&bits, 2).unwrap_or(0);
                writeln!(f, "  {}: {}\t\t[{}] at {}", name, bits, value, pos)?;
            }
        }
        Ok(())
    }
}
