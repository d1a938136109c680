use std::process::ExitCode;

use clap::Parser;
use rustyline::{error::ReadlineError, DefaultEditor};
use tracing_subscriber::EnvFilter;

use lua_vm::{LuaError, LuaTable, LuaValue, StdLib, Vm, VmConfig};

/// Lua 5.4 interpreter
#[derive(Parser)]
#[command(name = "lua")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run Lua scripts or start an interactive prompt")]
struct Cli {
    /// Script to run; `-` reads standard input
    #[arg(value_name = "SCRIPT")]
    script: Option<String>,

    /// Arguments passed to the script as `...` and `arg`
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Execute a chunk of code before the script
    #[arg(short = 'e', value_name = "CHUNK")]
    exec: Vec<String>,

    /// Enter interactive mode after running the script
    #[arg(short = 'i')]
    interactive: bool,

    /// Print the compiled bytecode instead of running
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Leave out os.getenv, os.exit, os.remove and os.rename
    #[arg(long)]
    no_unsafe: bool,

    /// Maximum number of nested Lua calls
    #[arg(long, value_name = "N")]
    max_depth: Option<usize>,

    /// Log more (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> VmConfig {
        let libs = if self.no_unsafe {
            StdLib::safe()
        } else {
            StdLib::all()
        };
        let mut config = VmConfig::new().libs(libs);
        if let Some(depth) = self.max_depth {
            config = config.max_call_depth(depth);
        }
        config
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// A syntax error that more input could fix.
fn is_incomplete(err: &LuaError) -> bool {
    match err {
        LuaError::Syntax(e) => e.message.ends_with("near <eof>") || e.message.starts_with("unfinished"),
        _ => false,
    }
}

fn read_source(path: &str) -> Result<String, String> {
    let src = if path == "-" {
        std::io::read_to_string(std::io::stdin())
    } else {
        std::fs::read_to_string(path)
    };
    let src = src.map_err(|e| format!("cannot open {path}: {e}"))?;
    // A leading `#!` line is not Lua.
    Ok(match src.strip_prefix("#") {
        Some(rest) => rest.find('\n').map_or(String::new(), |i| format!("--{}", &rest[i..])),
        None => src,
    })
}

fn chunk_name(path: &str) -> String {
    if path == "-" {
        "stdin".to_string()
    } else {
        path.to_string()
    }
}

fn report(vm: &mut Vm, err: &LuaError) {
    eprintln!("lua: {}", vm.error_to_string(err));
}

// ── Script runner ─────────────────────────────────────────────────────────────

fn run_chunk(vm: &mut Vm, src: &str, name: &str, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let f = vm.compile(src, name)?;
    vm.execute(&f, args)
}

fn list(path: &str) -> Result<(), String> {
    let src = read_source(path)?;
    let proto = lua_compiler::compile(&src, &chunk_name(path)).map_err(|e| e.to_string())?;
    print!("{}", lua_compiler::disassemble(&proto));
    Ok(())
}

fn run_script(vm: &mut Vm, path: &str, args: &[String]) -> Result<(), ()> {
    let src = read_source(path).map_err(|e| eprintln!("lua: {e}"))?;
    tracing::debug!(script = path, args = args.len(), "running script");

    let arg = LuaTable::new();
    arg.set_int(0, path);
    for (i, a) in args.iter().enumerate() {
        arg.set_int(i as i64 + 1, a.as_str());
    }
    vm.set_global("arg", arg);

    let values: Vec<LuaValue> = args.iter().map(|a| LuaValue::from(a.as_str())).collect();
    run_chunk(vm, &src, &chunk_name(path), &values)
        .map(drop)
        .map_err(|e| report(vm, &e))
}

// ── Interactive REPL ──────────────────────────────────────────────────────────

fn repl(vm: &mut Vm) {
    println!("Lua 5.4 ({})  (type 'exit' or Ctrl-D to quit)", env!("CARGO_PKG_NAME"));

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("lua: cannot start line editor: {e}");
            return;
        }
    };
    let mut buf = String::new();

    loop {
        let prompt = if buf.is_empty() { "> " } else { ">> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if buf.is_empty() {
                    if line.trim() == "exit" {
                        break;
                    }
                    if !line.trim().is_empty() {
                        let _ = rl.add_history_entry(line.as_str());
                    }
                } else {
                    buf.push('\n');
                }
                buf.push_str(&line);

                // Bare expressions print their values; everything else runs
                // as statements. Incomplete input keeps accumulating.
                let compiled = vm
                    .compile(&format!("return {buf}"), "stdin")
                    .or_else(|_| vm.compile(&buf, "stdin"));
                let f = match compiled {
                    Ok(f) => f,
                    Err(e) if is_incomplete(&e) => continue,
                    Err(e) => {
                        eprintln!("{e}");
                        buf.clear();
                        continue;
                    }
                };
                buf.clear();
                match vm.execute(&f, &[]) {
                    Ok(values) if values.is_empty() => {}
                    Ok(values) => {
                        let shown: Vec<String> = values.iter().map(ToString::to_string).collect();
                        println!("{}", shown.join("\t"));
                    }
                    Err(e) => report(vm, &e),
                }
            }

            // Ctrl-D
            Err(ReadlineError::Eof) => {
                println!();
                break;
            }

            // Ctrl-C cancels the pending input.
            Err(ReadlineError::Interrupted) => buf.clear(),

            Err(e) => {
                eprintln!("lua: read error: {e}");
                break;
            }
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.list {
        let Some(path) = cli.script.as_deref() else {
            eprintln!("lua: -l needs a script");
            return ExitCode::FAILURE;
        };
        return match list(path) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("lua: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let mut vm = Vm::with_config(cli.config());

    for chunk in &cli.exec {
        if let Err(e) = run_chunk(&mut vm, chunk, "(command line)", &[]) {
            report(&mut vm, &e);
            return ExitCode::FAILURE;
        }
    }

    match cli.script.as_deref() {
        Some(path) => {
            if run_script(&mut vm, path, &cli.args).is_err() {
                return ExitCode::FAILURE;
            }
            if cli.interactive {
                repl(&mut vm);
            }
        }
        None if cli.exec.is_empty() || cli.interactive => repl(&mut vm),
        None => {}
    }
    ExitCode::SUCCESS
}
