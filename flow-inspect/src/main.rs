#[macro_use]
extern crate log;

use clap::{crate_version, App, Arg};
use crossbeam_channel::unbounded;
use flate2::read::GzDecoder;
use libflow_inspect::{
    ACRun, ACStart, Analyzer, EngineConfig, EthDecoder, IgnoreHook, NoHa, NullSession, PktType,
    ReadbackCapture, State,
};
use libflow_tools::Config;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use xz2::read::XzDecoder;

fn load_config(filename: &str) -> io::Result<Config> {
    debug!("Loading configuration {}", filename);
    let path = Path::new(&filename);
    let file = File::open(path)?;
    Config::load(file).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn open_input(name: &str) -> io::Result<Box<dyn Read + Send>> {
    if name == "-" {
        return Ok(Box::new(io::stdin()) as Box<dyn Read + Send>);
    }
    let path = Path::new(&name);
    let file = File::open(path)?;
    let reader = if name.ends_with(".gz") {
        Box::new(GzDecoder::new(file)) as Box<dyn Read + Send>
    } else if name.ends_with(".xz") {
        Box::new(XzDecoder::new(file)) as Box<dyn Read + Send>
    } else {
        Box::new(file) as Box<dyn Read + Send>
    };
    Ok(reader)
}

fn main() -> io::Result<()> {
    let matches = App::new("Flow inspector")
        .version(crate_version!())
        .about("Flow tracking and inspection over pcap files")
        .arg(
            Arg::with_name("verbose")
                .help("Be verbose")
                .short("v")
                .long("verbose"),
        )
        .arg(
            Arg::with_name("config")
                .help("Configuration file")
                .short("c")
                .long("config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("skip")
                .help("Pass the first <N> messages without processing")
                .short("k")
                .long("skip")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("count")
                .help("Stop after processing <N> messages")
                .short("n")
                .long("count")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("INPUT")
                .help("Input file name(s), '-' for stdin")
                .required(true)
                .multiple(true),
        )
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    if matches.is_present("verbose") {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    debug!("Flow inspector {}", crate_version!());

    let config = match matches.value_of("config") {
        Some(filename) => load_config(filename)?,
        None => Config::default(),
    };
    let engine_config = {
        let mut ec = EngineConfig::from_config(&config);
        // file readback: verdicts are counted, not enforced
        ec.read_mode = true;
        Arc::new(ec)
    };

    let skip: u64 = matches
        .value_of("skip")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let count: u64 = matches
        .value_of("count")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let inputs: Vec<&str> = matches.values_of("INPUT").unwrap().collect();
    if inputs.len() > num_cpus::get() {
        warn!(
            "{} inputs for {} cpus; analyzers will contend",
            inputs.len(),
            num_cpus::get()
        );
    }

    let (poke_tx, poke_rx) = unbounded();
    let mut threads = Vec::new();

    for (id, input) in inputs.iter().enumerate() {
        let reader = open_input(input)?;
        let capture = ReadbackCapture::new(reader);
        let mut analyzer = Analyzer::new(
            id,
            engine_config.clone(),
            Box::new(capture),
            Box::new(EthDecoder),
            Box::new(IgnoreHook),
            Box::new(NoHa),
            input,
        );
        analyzer.set_poke(poke_tx.clone());
        analyzer.set_skip_cnt(skip);
        analyzer.set_exit_after_cnt(count);
        for t in PktType::all().iter() {
            analyzer
                .flow_control_mut()
                .init_proto(*t, Box::new(|_| Box::new(NullSession)));
        }

        let handle = analyzer.handle();
        handle.execute(Box::new(ACStart));
        handle.execute(Box::new(ACRun { paused: false }));
        threads.push((handle, analyzer.spawn()));
    }
    drop(poke_tx);

    let mut remaining = threads.len();
    while remaining > 0 {
        match poke_rx.recv() {
            Ok((id, state)) => {
                debug!("analyzer {} -> {:?}", id, state);
                if state == State::Stopped {
                    remaining -= 1;
                }
            }
            Err(_) => break,
        }
    }

    for (handle, join) in threads {
        let analyzer = join.join().expect("analyzer thread panicked");
        let _ = handle.take_completed();

        println!("--- [{}] {} ---", handle.id(), analyzer.source());
        for (name, value) in analyzer.counts().pegs() {
            println!("{:>24}: {}", name, value);
        }
        let fc = analyzer.flow_control();
        println!("{:>24}: {}", "flows", fc.get_num_flows());
        println!("{:>24}: {}", "total_prunes", fc.get_total_prunes());
        for (name, value) in analyzer.capture_pegs() {
            println!("{:>24}: {}", name, value);
        }
    }

    Ok(())
}
