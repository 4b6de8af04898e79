use acc32::compiler::{self, CompileError, CompilerConfig};

use clap::{App, Arg, ArgMatches};
use slog::{o, Drain, Logger};
use slog_term::{FullFormat, TermDecorator};

enum Error {
    Compile(CompileError),
    InvalidArgument(String),
    IO(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::IO(e)
    }
}

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Error {
        Error::Compile(e)
    }
}

fn parse_arguments() -> ArgMatches<'static> {
    App::new("acc32c")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Compiles source programs into assembly for the accumulator machine")
        .arg(Arg::with_name("source")
             .help("File containing the source program")
             .value_name("SOURCE")
             .required(true)
             .index(1))
        .arg(Arg::with_name("target")
             .help("File the assembly is written to")
             .value_name("TARGET")
             .required(true)
             .index(2))
        .arg(Arg::with_name("stack-size")
             .help("Number of words reserved for the stack")
             .long("stack-size")
             .short("s")
             .takes_value(true)
             .value_name("WORDS"))
        .arg(Arg::with_name("verbose")
             .help("Log every compilation stage to the terminal")
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
        Ok(()) => (),
        Err(Error::IO(io)) => {
            eprintln!("IO error: {}", io);
            std::process::exit(1);
        },
        Err(Error::InvalidArgument(msg)) => {
            eprintln!("{}", msg);
            std::process::exit(2);
        },
        Err(Error::Compile(err)) => {
            eprintln!("{}", err);
            eprintln!("compilation failed with {} error(s)", err.count());
            std::process::exit(1);
        },
    }
}

fn run(args: &ArgMatches, logger: Option<Logger>) -> Result<(), Error> {
    let mut config = CompilerConfig::default();

    if let Some(value) = args.value_of("stack-size") {
        config.stack_size = value.parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid stack size: {}", value)))?;
    }

    // Both arguments are required, clap exits before this point if either is missing.
    let source_path = args.value_of("source").unwrap_or_default();
    let target_path = args.value_of("target").unwrap_or_default();

    let source = std::fs::read_to_string(source_path)?;
    let lines = compiler::compile_with_config(&source, &config, logger)?;

    let mut text = lines.join("\n");
    text.push('\n');

    std::fs::write(target_path, text)?;

    Ok(())
}
