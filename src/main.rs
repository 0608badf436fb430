//! dlbridge - command line front end
//!
//! Loads a shared library, binds a declared signature and calls it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dlbridge::config::BridgeConfig;
use dlbridge::ffi::{FfiFunctionInfo, FfiRegistry, FfiSignature, FfiType, FfiValue, Loader};
use dlbridge::isolate::{IsolatedCall, IsolationOutcome};
use serde_json::json;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit code when at least one symbol passed to `check` is missing, and for errors.
const EXIT_FAILURE: i32 = 1;
/// Exit code when an isolated call was terminated by a signal.
const EXIT_CRASHED: i32 = 3;
/// Exit code when an isolated call ran past `--timeout-ms`.
const EXIT_TIMED_OUT: i32 = 4;

#[derive(Parser)]
#[command(name = "dlb")]
#[command(version)]
#[command(about = "Call exported C functions of shared libraries", long_about = None)]
struct Cli {
    /// Config file (default: dlbridge.toml in the current directory or a parent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a library and call one function with a declared signature
    Call {
        /// Library path or name (e.g. ./libembed.so, m, libc.so.6)
        library: String,

        /// C-style declaration, e.g. "i32 double_me(i32)"
        signature: String,

        /// Arguments, read as the declared parameter types
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,

        /// Call the function this many times
        #[arg(long, default_value = "1")]
        repeat: usize,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Run the call in a child process
        #[arg(long)]
        isolate: bool,

        /// Kill the isolated call after this many milliseconds
        #[arg(long, requires = "isolate")]
        timeout_ms: Option<u64>,
    },

    /// Load a library and check that symbols are exported
    Check {
        /// Library path or name
        library: String,

        /// Symbol names to resolve
        symbols: Vec<String>,
    },

    /// Call a function declared in the config file
    Run {
        /// Qualified name, library:function
        function: String,

        /// Arguments, read as the declared parameter types
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Run the call in a child process
        #[arg(long)]
        isolate: bool,

        /// Kill the isolated call after this many milliseconds
        #[arg(long, requires = "isolate")]
        timeout_ms: Option<u64>,
    },

    /// List libraries and functions declared in the config file
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    setup_logging(cli.debug);

    match run(cli) {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(EXIT_FAILURE);
        }
    }
}

/// Set up logging/tracing. Logs go to stderr so results on stdout stay parseable.
fn setup_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::try_new("dlbridge=debug,dlb=debug,warn").unwrap_or_else(|_| EnvFilter::new("warn"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if debug {
        tracing::debug!("Debug logging enabled");
    }
}

fn run(cli: Cli) -> Result<i32> {
    let global = GlobalArgs {
        config: cli.config,
        debug: cli.debug,
    };

    match cli.command {
        Commands::Call {
            library,
            signature,
            args,
            repeat,
            json,
            isolate,
            timeout_ms,
        } => {
            if isolate {
                let mut child = vec![OsString::from("call"), library.into(), signature.into()];
                child.push("--repeat".into());
                child.push(repeat.to_string().into());
                if json {
                    child.push("--json".into());
                }
                return cmd_isolated(&global, child, args, timeout_ms);
            }
            cmd_call(&global, &library, &signature, &args, repeat, json)
        }
        Commands::Check { library, symbols } => cmd_check(&global, &library, &symbols),
        Commands::Run {
            function,
            args,
            json,
            isolate,
            timeout_ms,
        } => {
            if isolate {
                let mut child = vec![OsString::from("run"), function.into()];
                if json {
                    child.push("--json".into());
                }
                return cmd_isolated(&global, child, args, timeout_ms);
            }
            cmd_run(&global, &function, &args, json)
        }
        Commands::List { json } => cmd_list(&global, json),
    }
}

/// Flags shared by every subcommand.
struct GlobalArgs {
    config: Option<PathBuf>,
    debug: bool,
}

impl GlobalArgs {
    fn load_config(&self) -> Result<BridgeConfig> {
        match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("Failed to load config '{}'", path.display())),
            None => BridgeConfig::load_from_cwd().context("Failed to load dlbridge.toml"),
        }
    }

    fn loader(&self) -> Result<Loader> {
        Ok(self.load_config()?.loader.build_loader())
    }

    /// The same flags, spelled for a child `dlb` process.
    fn to_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push(OsString::from("--config"));
            args.push(config.clone().into_os_string());
        }
        if self.debug {
            args.push(OsString::from("--debug"));
        }
        args
    }
}

fn cmd_call(
    global: &GlobalArgs,
    library: &str,
    signature: &str,
    args: &[String],
    repeat: usize,
    json: bool,
) -> Result<i32> {
    let sig = FfiSignature::parse(signature)
        .with_context(|| format!("Invalid signature '{}'", signature))?;
    let values = parse_args(&sig, args)?;

    let loader = global.loader()?;
    let lib = loader.load(library)?;

    // SAFETY: the declared signature is the user's assertion about the
    // binary; nothing can verify it. A wrong one is fatal, which is what
    // `--isolate` is for.
    let binding = unsafe { lib.bind(&sig)? };

    let mut results = Vec::with_capacity(repeat);
    for _ in 0..repeat {
        results.push(binding.invoke(&values)?);
    }

    if json {
        let output = json!({
            "library": lib.path().display().to_string(),
            "signature": sig.to_string(),
            "results": results.iter().map(value_to_json).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for result in &results {
            println!("{}", result);
        }
    }

    drop(binding);
    lib.release()?;
    Ok(0)
}

fn cmd_check(global: &GlobalArgs, library: &str, symbols: &[String]) -> Result<i32> {
    let loader = global.loader()?;
    let lib = loader.load(library)?;
    println!("Loaded {} (handle {})", lib.path().display(), lib.id());

    let mut missing = 0;
    for symbol in symbols {
        match lib.resolve(symbol) {
            Ok(addr) => println!("  ok       {:<24} {:#x}", symbol, addr),
            Err(e) => {
                tracing::debug!(error = %e, "symbol check failed");
                println!("  missing  {}", symbol);
                missing += 1;
            }
        }
    }

    lib.release()?;

    if missing > 0 {
        eprintln!("{} of {} symbol(s) missing", missing, symbols.len());
        return Ok(EXIT_FAILURE);
    }
    Ok(0)
}

fn cmd_run(global: &GlobalArgs, function: &str, args: &[String], json: bool) -> Result<i32> {
    let (library, name) = function
        .split_once(':')
        .with_context(|| format!("Expected library:function, got '{}'", function))?;

    let config = global.load_config()?;
    let lib_config = config
        .library(library)
        .with_context(|| format!("Library '{}' is not declared in the config", library))?;

    let (signature, description) = lib_config
        .functions
        .iter()
        .filter_map(|f| {
            FfiSignature::parse(&f.signature)
                .ok()
                .map(|sig| (sig, f.description.clone()))
        })
        .find(|(sig, _)| sig.name == name)
        .with_context(|| format!("Function '{}' is not declared in the config", function))?;

    let values = parse_args(&signature, args)?;

    let mut registry = FfiRegistry::with_loader(config.loader.build_loader());
    registry.load_library(library, lib_config.path.as_deref())?;
    // SAFETY: the config file asserts the signature; see `cmd_call`.
    unsafe { registry.declare(FfiFunctionInfo::new(library, signature, description))? };

    let result = registry.call(function, &values)?;
    if json {
        let output = json!({
            "function": function,
            "result": value_to_json(&result),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", result);
    }

    registry.unload(library)?;
    Ok(0)
}

fn cmd_list(global: &GlobalArgs, json: bool) -> Result<i32> {
    let config = global.load_config()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config.libraries)?);
        return Ok(0);
    }

    if config.libraries.is_empty() {
        println!("No libraries declared");
        return Ok(0);
    }

    for library in &config.libraries {
        match &library.path {
            Some(path) => println!("{} ({})", library.name, path),
            None => println!("{}", library.name),
        }
        for function in &library.functions {
            if function.description.is_empty() {
                println!("  {}", function.signature);
            } else {
                println!("  {:<32} {}", function.signature, function.description);
            }
        }
    }
    Ok(0)
}

/// Re-run this command in a child `dlb` so a crash or hang in foreign code
/// cannot take this process with it.
fn cmd_isolated(
    global: &GlobalArgs,
    command: Vec<OsString>,
    args: Vec<String>,
    timeout_ms: Option<u64>,
) -> Result<i32> {
    let mut call = IsolatedCall::current_exe()
        .context("Failed to locate the dlb executable")?
        .args(global.to_args())
        .args(command)
        .arg("--")
        .args(args);
    if let Some(ms) = timeout_ms {
        call = call.timeout(Duration::from_millis(ms));
    }

    match call.run()? {
        IsolationOutcome::Completed { stdout, stderr } => {
            print!("{}", stdout);
            eprint!("{}", stderr);
            Ok(0)
        }
        IsolationOutcome::Failed {
            code,
            stdout,
            stderr,
        } => {
            print!("{}", stdout);
            eprint!("{}", stderr);
            Ok(code)
        }
        IsolationOutcome::Crashed { signal, stderr } => {
            eprint!("{}", stderr);
            match signal {
                Some(signal) => eprintln!("Error: call terminated by signal {}", signal),
                None => eprintln!("Error: call terminated abnormally"),
            }
            Ok(EXIT_CRASHED)
        }
        IsolationOutcome::TimedOut { after } => {
            eprintln!("Error: call timed out after {} ms", after.as_millis());
            Ok(EXIT_TIMED_OUT)
        }
    }
}

/// Read textual arguments as the declared parameter types.
///
/// Extra arguments (for `...`, or a count mismatch reported later by the
/// invoker) are read as integers when they look like one, else as strings.
fn parse_args(sig: &FfiSignature, args: &[String]) -> Result<Vec<FfiValue>> {
    args.iter()
        .enumerate()
        .map(|(i, text)| match sig.params.get(i) {
            Some(&ty) => FfiValue::parse_as(ty, text)
                .with_context(|| format!("Argument {} of '{}'", i, sig.name)),
            None => Ok(FfiValue::parse_as(FfiType::I64, text)
                .unwrap_or_else(|_| FfiValue::String(text.clone()))),
        })
        .collect()
}

fn value_to_json(value: &FfiValue) -> serde_json::Value {
    match value {
        FfiValue::Void => serde_json::Value::Null,
        FfiValue::Integer(v) => json!(v),
        FfiValue::Signed(v) => json!(v),
        FfiValue::Float(v) => json!(v),
        FfiValue::Pointer(p) => json!(format!("{:#x}", p)),
        FfiValue::String(s) => json!(s),
        FfiValue::Buffer(bytes) => json!(bytes),
    }
}
