//! `nbvm`: inspect, verify and run raw bytecode files.
//!
//! Usage: `nbvm [--json] <disasm|cfg|verify|run|explain> <file|code>`

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nbvm::cfg::Graph;
use nbvm::diagnostic::ansi::AnsiRenderer;
use nbvm::diagnostic::{json, registry, Diagnostic};
use nbvm::{disassemble, Boxed, Error, Interpreter, Kind, Options, Program, Verifier};

#[derive(Parser, Debug)]
#[command(name = "nbvm", version)]
#[command(about = "Inspect, verify and run NaN-boxed stack bytecode")]
struct Cli {
    /// Report errors as JSON diagnostics
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the disassembly
    Disasm { file: PathBuf },
    /// Print basic blocks and their edges
    Cfg { file: PathBuf },
    /// Type-check without running
    Verify { file: PathBuf },
    /// Verify, run, and print the remaining stack
    Run {
        file: PathBuf,

        /// Skip the verifier
        #[arg(long)]
        no_verify: bool,

        /// JSON file with interpreter options
        #[arg(long)]
        options: Option<PathBuf>,
    },
    /// Explain an error code such as VM0005
    Explain { code: String },
}

enum Failure {
    Message(String),
    Vm(Error, Vec<u8>),
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn read(path: &Path) -> Result<Vec<u8>, Failure> {
    std::fs::read(path).map_err(|e| Failure::Message(format!("cannot read {}: {e}", path.display())))
}

fn load_options(path: Option<&Path>) -> Result<Options, Failure> {
    let Some(path) = path else { return Ok(Options::default()) };
    let text = std::fs::read_to_string(path)
        .map_err(|e| Failure::Message(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| Failure::Message(format!("invalid options in {}: {e}", path.display())))
}

fn format_value(interp: &Interpreter, v: Boxed) -> String {
    if v.kind() == Kind::Ref {
        if let Some(s) = interp.string(v) {
            return format!("string {s:?}");
        }
        if let Some(n) = interp.int64(v) {
            return format!("i64 {n}");
        }
    }
    v.to_string()
}

fn execute(command: Command) -> Result<(), Failure> {
    match command {
        Command::Disasm { file } => {
            print!("{}", disassemble(&read(&file)?));
        }
        Command::Cfg { file } => {
            let code = read(&file)?;
            let graph = Graph::build(&code).map_err(|e| Failure::Vm(e, code.clone()))?;
            print!("{graph}");
        }
        Command::Verify { file } => {
            let program = Program::new(read(&file)?);
            Verifier::new(&program).verify().map_err(|e| Failure::Vm(e, program.code.clone()))?;
            println!("ok");
        }
        Command::Run { file, no_verify, options } => {
            let options = load_options(options.as_deref())?;
            let program = Program::new(read(&file)?);
            let code = program.code.clone();
            if !no_verify {
                Verifier::with_options(&program, &options).verify().map_err(|e| Failure::Vm(e, code.clone()))?;
            }
            let mut interp = Interpreter::with_options(program, options);
            interp.run().map_err(|e| Failure::Vm(e, code))?;
            for &v in interp.stack() {
                println!("{}", format_value(&interp, v));
            }
        }
        Command::Explain { code } => {
            let entry = registry::lookup(&code).ok_or_else(|| Failure::Message(format!("unknown error code '{code}'")))?;
            print!("{}", entry.long);
        }
    }
    Ok(())
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(failure) = execute(cli.command) {
        let diagnostic = match &failure {
            Failure::Message(message) => Diagnostic::error(message.as_str()),
            Failure::Vm(error, code) => Diagnostic::from(error).with_bytecode(code),
        };
        if cli.json {
            eprintln!("{}", json::render(&diagnostic));
        } else {
            let renderer = AnsiRenderer { use_color: std::io::stderr().is_terminal() };
            eprint!("{}", renderer.render(&diagnostic));
        }
        process::exit(1);
    }
}
