use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use graphport::{
    DynamicAxes, DynamicAxis, ExportConfig, ExportError, Exporter, ShapePolicy, TargetFormat,
};

struct Args {
    /// Model file to load (JSON interchange format, or an existing `.gport`
    /// artifact).
    input: PathBuf,

    /// Destination path for the exported artifact.
    output: PathBuf,

    /// Dynamic axis requests, in the order given.
    dynamic: Vec<String>,

    /// Skip the simplification pipeline.
    no_simplify: bool,

    /// Target container format.
    format: TargetFormat,

    /// Operator-set version to emit.
    opset: Option<u32>,

    /// Fixpoint iteration budget.
    max_iterations: Option<usize>,

    /// Fail instead of degrading when a shape cannot be derived.
    strict_shapes: bool,

    /// Print the report as JSON instead of a human-readable summary.
    report_json: bool,

    /// Enable verbose logging.
    verbose: bool,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut values = VecDeque::new();
    let mut dynamic = Vec::new();
    let mut no_simplify = false;
    let mut format = TargetFormat::Binary;
    let mut opset = None;
    let mut max_iterations = None;
    let mut strict_shapes = false;
    let mut report_json = false;
    let mut verbose = false;

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Value(val) => values.push_back(val.string()?),
            Short('d') | Long("dynamic") => dynamic.push(parser.value()?.string()?),
            Long("no-simplify") => no_simplify = true,
            Short('f') | Long("format") => {
                let name = parser.value()?.string()?;
                format = TargetFormat::from_name(&name)
                    .ok_or_else(|| format!("unknown format \"{}\"", name))?;
            }
            Long("opset") => opset = Some(parser.value()?.parse()?),
            Long("max-iterations") => max_iterations = Some(parser.value()?.parse()?),
            Long("strict-shapes") => strict_shapes = true,
            Long("report-json") => report_json = true,
            Short('v') | Long("verbose") => verbose = true,
            Short('h') | Long("help") => {
                println!(
                    "Export and simplify graphport models.

Usage: {bin_name} [OPTIONS] <input> <output>

  -d, --dynamic <SPEC>    Generalize an input axis. SPEC is
                          \"<input>:<axis>=<name>\" or \"auto\".
                          May be repeated.
      --no-simplify       Skip the simplification pipeline
  -f, --format <FMT>      Output format: bin (default) or json
      --opset <N>         Operator-set version to emit
      --max-iterations N  Simplification fixpoint budget
      --strict-shapes     Fail if a shape cannot be derived
      --report-json       Print the export report as JSON
  -v, --verbose           Enable verbose logging
  -h, --help              Print help
",
                    bin_name = parser.bin_name().unwrap_or("graphport")
                );
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    let input = values.pop_front().ok_or("missing `<input>` arg")?;
    let output = values.pop_front().ok_or("missing `<output>` arg")?;

    Ok(Args {
        input: input.into(),
        output: output.into(),
        dynamic,
        no_simplify,
        format,
        opset,
        max_iterations,
        strict_shapes,
        report_json,
        verbose,
    })
}

/// Parse `--dynamic` specs into a [`DynamicAxes`] configuration.
fn parse_dynamic_axes(specs: &[String]) -> Result<Option<DynamicAxes>, String> {
    if specs.is_empty() {
        return Ok(None);
    }
    if specs.iter().any(|spec| spec == "auto") {
        if specs.len() > 1 {
            return Err("\"auto\" cannot be combined with explicit axes".to_string());
        }
        return Ok(Some(DynamicAxes::Auto));
    }

    let mut axes = Vec::with_capacity(specs.len());
    for spec in specs {
        let parsed = (|| {
            let (location, name) = spec.split_once('=')?;
            let (input, axis) = location.split_once(':')?;
            let input: usize = input.parse().ok()?;
            let axis: usize = axis.parse().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(DynamicAxis::new(input, axis, name))
        })();
        match parsed {
            Some(axis) => axes.push(axis),
            None => {
                return Err(format!(
                    "invalid dynamic axis \"{}\" (expected <input>:<axis>=<name>)",
                    spec
                ));
            }
        }
    }
    Ok(Some(DynamicAxes::Axes(axes)))
}

fn format_param_count(n: usize) -> String {
    if n >= 1_000_000 {
        format!("{:.1} M", n as f32 / 1_000_000.)
    } else {
        format!("{:.1} K", n as f32 / 1000.)
    }
}

fn format_byte_count(n: usize) -> String {
    if n >= 1_000_000 {
        format!("{:.1} MB", n as f32 / 1_000_000.)
    } else {
        format!("{:.1} KB", n as f32 / 1000.)
    }
}

struct CliError {
    message: String,
    code: u8,
}

impl From<String> for CliError {
    fn from(message: String) -> CliError {
        CliError { message, code: 1 }
    }
}

/// Exit statuses: each export error kind maps to a distinct code so
/// wrapping scripts can react to specific failures.
fn exit_code_for(err: &ExportError) -> u8 {
    match err {
        ExportError::MalformedGraph(_) | ExportError::Optimize(_) => 2,
        ExportError::DynamicAxes(_) => 3,
        ExportError::Encode(_) => 4,
        ExportError::Verify(_) | ExportError::Io(_) => 5,
    }
}

fn run(args: &Args) -> Result<(), CliError> {
    let bytes = fs::read(&args.input)
        .map_err(|err| format!("failed to read {}: {}", args.input.display(), err))?;
    let model = graphport::decode(&bytes)
        .map_err(|err| format!("failed to load {}: {}", args.input.display(), err))?;

    let dynamic_axes = parse_dynamic_axes(&args.dynamic)?;
    let mut config = ExportConfig {
        dynamic_axes,
        simplify: !args.no_simplify,
        target_format: args.format,
        ..ExportConfig::default()
    };
    if let Some(opset) = args.opset {
        config.opset_version = opset;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_fixpoint_iterations = max_iterations;
    }
    if args.strict_shapes {
        config.shape_policy = ShapePolicy::Strict;
    }

    let exporter = Exporter::new(config);
    let report = exporter.export(&model.graph, &args.output).map_err(|err| CliError {
        message: err.to_string(),
        code: exit_code_for(&err),
    })?;

    if args.report_json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|err| CliError::from(format!("failed to render report: {}", err)))?;
        println!("{}", json);
        return Ok(());
    }

    println!(
        "exported {} ({})",
        args.output.display(),
        format_byte_count(report.artifact_bytes)
    );
    println!(
        "operators: {} -> {}",
        report.nodes_before, report.nodes_after
    );
    for (pass, count) in &report.pass_changes {
        if *count > 0 {
            println!("  {}: {} rewrites", pass, count);
        }
    }
    println!("parameters: {}", format_param_count(report.parameters));
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("Error: {}", err);
            eprintln!("Run with --help for usage.");
            return ExitCode::from(1);
        }
    };

    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err.message);
            ExitCode::from(err.code)
        }
    }
}
