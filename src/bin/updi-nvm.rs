//! Command-line front-end for the `updi-nvm` library.
//!
//! Argument parsing only: this binary translates flags into calls against
//! [`updi_nvm::UpdiNvmProgrammer`]. Fuse-syntax validation beyond a
//! `nr:0xvv` split, HEX-with-fuses splitting, and optional high-voltage
//! pulse control are explicit non-goals (see DESIGN.md).

use std::fs;
use std::process;

use clap::{App, Arg};
use log::{error, info};

use updi_nvm::nvm::device;
use updi_nvm::nvm::{self, UpdiNvmProgrammer};
use updi_nvm::ProtocolError;

fn parse_fuse(spec: &str) -> Result<(u32, u8), String> {
    let mut parts = spec.splitn(2, ':');
    let nr = parts.next().ok_or_else(|| format!("bad fuse spec '{}'", spec))?;
    let val = parts.next().ok_or_else(|| format!("bad fuse spec '{}'", spec))?;
    let nr: u32 = nr
        .parse()
        .map_err(|_| format!("bad fuse number '{}'", nr))?;
    let val = val.trim_start_matches("0x").trim_start_matches("0X");
    let val = u8::from_str_radix(val, 16).map_err(|_| format!("bad fuse value '{}'", val))?;
    Ok((nr, val))
}

fn run() -> Result<(), ProtocolError> {
    let matches = App::new("updi-nvm")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Programs AVR UPDI targets over a serial-bridged single-wire link")
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .takes_value(true)
                .required(true)
                .help("target part name, e.g. attiny817"),
        )
        .arg(
            Arg::with_name("comport")
                .short("c")
                .long("comport")
                .takes_value(true)
                .required(true)
                .help("serial port path, e.g. /dev/ttyUSB0"),
        )
        .arg(
            Arg::with_name("baudrate")
                .short("b")
                .long("baudrate")
                .takes_value(true)
                .default_value("115200"),
        )
        .arg(Arg::with_name("info").long("info").help("print device info and exit"))
        .arg(Arg::with_name("erase").long("erase").help("chip erase"))
        .arg(
            Arg::with_name("flash")
                .short("f")
                .long("flash")
                .takes_value(true)
                .help("Intel HEX file to program into flash"),
        )
        .arg(
            Arg::with_name("verify")
                .long("verify")
                .help("read back and verify after --flash"),
        )
        .arg(
            Arg::with_name("fuses")
                .long("fuses")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("write a fuse, as nr:0xvv (repeatable)"),
        )
        .arg(
            Arg::with_name("read-fuses")
                .long("read-fuses")
                .help("read back and print all configured fuses"),
        )
        .arg(Arg::with_name("reset").long("reset").help("toggle reset and exit"))
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("increase log verbosity (-v, -vv, -vvv)"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    let device_name = matches.value_of("device").unwrap();
    let device = device::lookup(device_name).ok_or_else(|| {
        ProtocolError::UnknownDevice(format!(
            "{} (known: {})",
            device_name,
            device::supported_devices().join(", ")
        ))
    })?;

    let comport = matches.value_of("comport").unwrap();
    let baudrate: u32 = matches
        .value_of("baudrate")
        .unwrap()
        .parse()
        .unwrap_or(115_200);

    info!("opening {} at {} baud for {}", comport, baudrate, device.name);
    let mut programmer = UpdiNvmProgrammer::open(comport, baudrate, device.clone())?;

    if matches.is_present("info") {
        let info = programmer.get_device_info()?;
        println!("family:   {}", info.family);
        println!("nvm:      {}", info.nvm);
        println!("ocd:      {}", info.ocd);
        println!("osc:      {}", info.osc);
        if let Some(id) = info.device_id {
            println!("sig:      {}", id);
        }
        if let Some(rev) = info.device_rev {
            println!("revision: {}", rev);
        }
        return Ok(());
    }

    if matches.is_present("reset") {
        programmer.enter_progmode()?;
        programmer.leave_progmode()?;
        return Ok(());
    }

    if matches.is_present("erase")
        || matches.is_present("flash")
        || matches.is_present("fuses")
        || matches.is_present("read-fuses")
    {
        match programmer.enter_progmode() {
            Ok(()) => {}
            Err(updi_nvm::error::NvmError::App(updi_nvm::error::AppError::DeviceLocked)) => {
                info!("device is locked, unlocking via chip-erase key");
                programmer.unlock_device()?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if matches.is_present("erase") {
        info!("performing chip erase");
        programmer.chip_erase()?;
    }

    if let Some(hexfile) = matches.value_of("flash") {
        let contents = fs::read_to_string(hexfile)
            .map_err(|e| ProtocolError::Ihex(format!("reading {}: {}", hexfile, e)))?;
        let (image, start) = nvm::load_ihex(&contents, &device)?;
        info!("flashing {} bytes at 0x{:06x}", image.len(), start);
        if matches.is_present("verify") {
            let report = programmer.write_flash_verified(start, &image)?;
            if report.success {
                println!("verify OK ({} bytes)", image.len());
            } else {
                for (offset, expected, actual) in &report.mismatches {
                    println!(
                        "mismatch at offset {}: expected 0x{:02x}, read 0x{:02x}",
                        offset, expected, actual
                    );
                }
                error!("verify failed: {} mismatches", report.mismatches.len());
                process::exit(1);
            }
        } else {
            programmer.write_flash(start, &image)?;
        }
    }

    if let Some(fuses) = matches.values_of("fuses") {
        for spec in fuses {
            let (nr, val) = parse_fuse(spec).map_err(ProtocolError::Ihex)?;
            info!("writing fuse {} = 0x{:02x}", nr, val);
            programmer.write_fuse(nr, val)?;
        }
    }

    if matches.is_present("read-fuses") {
        for nr in 0..8 {
            match programmer.read_fuse(nr) {
                Ok(val) => println!("fuse {}: 0x{:02x}", nr, val),
                Err(_) => break,
            }
        }
    }

    if programmer.in_progmode() {
        programmer.leave_progmode()?;
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
