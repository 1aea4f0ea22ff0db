use log::info;
use simple_error::bail;
use std::error::Error;
use std::path::Path;
use vehicle_config::{ConfigMap, VehicleConfig};

/// Splits one `PROPERTY:BITSTRING` command-line argument at its first colon.
pub fn parse_pair(arg: &str) -> Result<(&str, &str), Box<dyn Error>> {
    match arg.split_once(':') {
        Some((property, bits)) if !property.is_empty() && !bits.is_empty() => {
            Ok((property, bits))
        }
        _ => {
            bail!(format!(
                "Argument {} should be in format PROPERTY:BITSTRING",
                arg
            ));
        }
    }
}

/// Applies the given field writes to the blob at `src_path` and writes the
/// resealed result to `dst_path`.
///
/// All pairs are validated against the map before anything is written; any
/// bad pair aborts the whole run. Returns true if a destination file was
/// written, which happens only when at least one field write was applied.
pub fn apply_edits(
    map_path: &Path,
    src_path: &Path,
    dst_path: &Path,
    pairs: &[&str],
) -> Result<bool, Box<dyn Error>> {
    info!("Read property map from {}", map_path.display());
    let map = ConfigMap::from_path(map_path)?;

    info!("Read config from {}", src_path.display());
    let mut config = VehicleConfig::from_path(src_path, &map)?;

    let mut updated = false;
    for pair in pairs {
        let (property, bits) = parse_pair(pair)?;
        config.set(&map, property, bits)?;
        updated = true;
    }

    if updated {
        config.seal();
        info!("Save updated config to {}", dst_path.display());
        config.write_to(dst_path)?;
    }
    Ok(updated)
}


#[cfg(test)]
mod session_tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    const MAP_JSON: &str = r#"{
        "size": 8,
        "project_code": 5,
        "ro.vehicle.config": {
            "AAA": "[0][2:0]",
            "FLV": "[1][3:0]",
            "HUD": "[2][7:7]",
            "RGN": "[3][6:2]"
        }
    }"#;

    #[rustfmt::skip]
    const BLOB: [u8; 8] = [
        0x65, 0x0f, 0x80, 0x54,
        0x00, 0x12, 0x34,
        0x1c,  // valid crc
    ];

    /// Scratch directory for one test, removed on drop.
    struct Scratch {
        dir: PathBuf,
    }

    impl Scratch {
        fn new(tag: &str) -> Scratch {
            let dir = std::env::temp_dir().join(format!("vce-test-{}-{}", tag, std::process::id()));
            fs::create_dir_all(&dir).unwrap();
            Scratch { dir }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.join(name)
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn end_to_end_edit() {
        let scratch = Scratch::new("edit");
        let map = scratch.path("map.json");
        let src = scratch.path("VehicleConfig.bin");
        let dst = scratch.path("NewVehicleConfig.bin");
        fs::write(&map, MAP_JSON).unwrap();
        fs::write(&src, BLOB).unwrap();

        let written =
            apply_edits(&map, &src, &dst, &["FLV:0011", "HUD:0", "RGN:01011"]).unwrap();
        assert!(written);

        #[rustfmt::skip]
        let expected: [u8; 8] = [
            0x65, 0x03, 0x00, 0x2c,
            0x00, 0x12, 0x34,
            0xe2,
        ];
        assert_eq!(expected.to_vec(), fs::read(&dst).unwrap());
        // The source is left alone.
        assert_eq!(BLOB.to_vec(), fs::read(&src).unwrap());
    }

    #[test]
    fn no_pairs_writes_nothing() {
        let scratch = Scratch::new("nopairs");
        let map = scratch.path("map.json");
        let src = scratch.path("VehicleConfig.bin");
        let dst = scratch.path("NewVehicleConfig.bin");
        fs::write(&map, MAP_JSON).unwrap();
        fs::write(&src, BLOB).unwrap();

        let written = apply_edits(&map, &src, &dst, &[]).unwrap();
        assert!(!written);
        assert!(!dst.exists());
    }

    #[test]
    fn bad_pair_aborts_before_writing() {
        let scratch = Scratch::new("abort");
        let map = scratch.path("map.json");
        let src = scratch.path("VehicleConfig.bin");
        let dst = scratch.path("NewVehicleConfig.bin");
        fs::write(&map, MAP_JSON).unwrap();
        fs::write(&src, BLOB).unwrap();

        assert!(apply_edits(&map, &src, &dst, &["FLV:0011", "NOPE:1"]).is_err());
        assert!(!dst.exists());
    }
}
