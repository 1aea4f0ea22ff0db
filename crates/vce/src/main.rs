use clap::{arg, command};
use std::error::Error;
use std::path::Path;

fn main() -> Result<(), Box<dyn Error>> {
    let matches = command!()
        .arg(arg!(-v --verbose ... "Increases verbosity by one level (can be repeated)"))
        .arg(
            arg!(--vmodule <FILTER> "sets the env_logger filter to the given string: \
                                     default,module::path=level,... \
                                     {trace,debug,info,warn,error,none}")
            .required(false),
        )
        .arg(
            arg!(--map <PATH> "path to the JSON map of property names to config bits")
                .required(false)
                .default_value("map.json"),
        )
        .arg(
            arg!(--src <PATH> "path to the source config binary")
                .required(false)
                .default_value("VehicleConfig.bin"),
        )
        .arg(
            arg!(--dst <PATH> "path to the destination config binary")
                .required(false)
                .default_value("NewVehicleConfig.bin"),
        )
        .arg(
            arg!([PAIR] "PROPERTY:BITSTRING field writes to apply; \
                         with none given, prints the decoded config instead")
            .multiple_values(true),
        )
        .get_matches();

    // Logging: configure before any real work so validation warnings land.
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(log::LevelFilter::Warn);
    match matches.occurrences_of("verbose") {
        0 => (),
        1 => {
            log_builder.filter_level(log::LevelFilter::Info);
        }
        2 => {
            log_builder.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            log_builder.filter_level(log::LevelFilter::Trace);
        }
    };
    if let Some(filter) = matches.value_of("vmodule") {
        log_builder.parse_filters(filter);
    }
    log_builder.init();

    let map_path = Path::new(matches.value_of("map").unwrap());
    let src_path = Path::new(matches.value_of("src").unwrap());
    let dst_path = Path::new(matches.value_of("dst").unwrap());
    let pairs: Vec<&str> = matches
        .values_of("PAIR")
        .map(|values| values.collect())
        .unwrap_or_default();

    if pairs.is_empty() {
        // Inspection mode: decode and print, touch nothing.
        let map = vehicle_config::ConfigMap::from_path(map_path)?;
        let config = vehicle_config::VehicleConfig::from_path(src_path, &map)?;
        println!("{:+}", config.report(&map));
    } else {
        vce::apply_edits(map_path, src_path, dst_path, &pairs)?;
    }
    Ok(())
}
