use acc32::{
    assembler::{self, AssembleError},
    control::{self, SimulationConfig, SimulationReport},
    datapath::{MachineError, StdIo, TestIo},
};

use clap::{App, Arg, ArgMatches};
use slog::{o, Drain, Logger};
use slog_term::{FullFormat, TermDecorator};

enum Error {
    Assemble(Vec<AssembleError>),
    Execution(MachineError),
    InvalidArgument(String),
    IO(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::IO(e)
    }
}

impl From<Vec<AssembleError>> for Error {
    fn from(e: Vec<AssembleError>) -> Error {
        Error::Assemble(e)
    }
}

impl From<MachineError> for Error {
    fn from(e: MachineError) -> Error {
        Error::Execution(e)
    }
}

fn parse_arguments() -> ArgMatches<'static> {
    App::new("acc32run")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Executes assembly programs on the accumulator machine")
        .arg(Arg::with_name("program")
             .help("File containing the assembly, one memory word per line")
             .value_name("PROGRAM")
             .required(true)
             .index(1))
        .arg(Arg::with_name("input")
             .help("File whose bytes are fed to IN. Standard input is used if omitted")
             .value_name("INPUT")
             .index(2))
        .arg(Arg::with_name("limit")
             .help("Maximum number of instructions to execute")
             .long("limit")
             .short("l")
             .takes_value(true)
             .value_name("COUNT"))
        .arg(Arg::with_name("verbose")
             .help("Log the execution to the terminal")
             .long("verbose")
             .short("v"))
        .get_matches()
}

fn main() {
    let args = parse_arguments();

    let logger = if args.is_present("verbose") {
        let decorator = TermDecorator::new().build();
        let drain = FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Some(Logger::root(drain, o!()))
    } else {
        None
    };

    match run(&args, logger) {
        Ok(report) => {
            eprintln!();
            eprintln!("stopped: {}", report.stop);
            eprintln!("instructions: {}", report.instructions);
            eprintln!("ticks: {}", report.ticks);
        },
        Err(Error::IO(io)) => {
            eprintln!("IO error: {}", io);
            std::process::exit(1);
        },
        Err(Error::InvalidArgument(msg)) => {
            eprintln!("{}", msg);
            std::process::exit(2);
        },
        Err(Error::Assemble(errors)) => {
            for err in &errors {
                eprintln!("{}", err);
            }
            std::process::exit(1);
        },
        Err(Error::Execution(err)) => {
            eprintln!("Execution error: {}", err);
            std::process::exit(1);
        },
    }
}

fn run(args: &ArgMatches, logger: Option<Logger>) -> Result<SimulationReport, Error> {
    let mut config = SimulationConfig::default();

    if let Some(value) = args.value_of("limit") {
        config.instruction_limit = value.parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid instruction limit: {}", value)))?;
    }

    let program_path = args.value_of("program").unwrap_or_default();
    let file = std::fs::read_to_string(program_path)?;
    let lines = file.lines().collect::<Vec<_>>();

    let memory = assembler::load(&lines[..], logger.clone())?;

    let report = match args.value_of("input") {
        Some(input_path) => {
            let input = std::fs::read(input_path)?;
            let io = TestIo::with_input(input.into_iter().map(i32::from));
            let report = control::simulate(memory, io, &config, logger)?;

            print!("{}", String::from_utf8_lossy(&report.output));

            report
        },
        None => control::simulate(memory, StdIo, &config, logger)?,
    };

    Ok(report)
}
