use clap::{ArgAction, Parser, ValueHint};
use evm_wp_cfg::cfg_gen::segments::collect_jump_dests;
use evm_wp_cfg::{analyze, AnalysisConfig, OutputHandler};
use eyre::{bail, WrapErr};
use std::{io::Write, path::Path, process::Command};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Either a path to a file containing the bytecode or the bytecode itself
    #[clap(value_hint = ValueHint::FilePath, value_name = "PATH or BYTECODE")]
    pub path_or_bytecode: String,

    /// Print the decoded instructions
    #[clap(long, short)]
    pub disassemble: bool,

    /// Print the segments the code is split into
    #[clap(long, short)]
    pub segments: bool,

    /// How many segments deep the cfg exploration goes
    #[clap(
        long = "cfg",
        value_name = "DEPTH",
        default_value_t = AnalysisConfig::default().max_depth
    )]
    pub max_depth: usize,

    /// Also emit the cfg before minimisation
    #[clap(long)]
    pub raw: bool,

    /// Filename and format for storing the minimised cfg. Supports all standard
    /// graphviz formats (*.dot, *.png, *.jpg, ...). Default is stdout in dot format
    #[clap(long, short)]
    pub output: Option<String>,

    /// Verbosity of the analysis
    ///
    /// Pass multiple times to increase the verbosity (e.g. -v, -vv, -vvv).
    ///
    /// Verbosity levels:
    ///
    ///   0: Print results only, warnings on stderr
    ///   1: Additionally print timings and pipeline summaries
    ///   2: Additionally log nodes, resolved jumps and partition splits
    ///   3: Additionally log every candidate jump and dropped path
    #[clap(long, short, verbatim_doc_comment, action = ArgAction::Count)]
    pub verbosity: u8,
}

fn write_dot(filename: &str, dot: &str) -> eyre::Result<()> {
    let mut file =
        std::fs::File::create(filename).wrap_err_with(|| format!("creating {filename}"))?;
    file.write_all(dot.as_bytes())
        .wrap_err_with(|| format!("writing {filename}"))?;
    println!("Dot file saved to {}", &filename);

    let ext = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("dot");
    if ext != "dot" {
        let output = Command::new("dot")
            .arg(format!("-T{ext}"))
            .arg("-o")
            .arg(filename) // output file
            .arg(filename) // file to read
            .output()
            .wrap_err("failed to run graphviz `dot`")?;

        if output.stderr.is_empty() {
            println!("File saved to {}", &filename);
        } else {
            bail!("dot failed: {}", String::from_utf8_lossy(&output.stderr));
        }
    }
    Ok(())
}

fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let level = match args.verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let path_string = args.path_or_bytecode;
    // check if path ends with .sol, if so, tell user to use solc to get bytecode and exit
    if path_string.ends_with(".sol") {
        println!("Use solc to get bytecode from solidity source files. ie:");
        println!("   `solc {} --bin-runtime --no-cbor-metadata --optimize`", &path_string);
        println!("then run this tool on the resulting bytecode");
        println!("   `evm-wp-cfg <bytecode>`");
        std::process::exit(1);
    }

    // check if path, if so read file, else use as bytecode
    let bytecode_string = std::fs::read_to_string(&path_string).unwrap_or(path_string);

    // sanitize bytecode string from newlines/spaces/etc
    let bytecode_string = bytecode_string.replace(['\n', ' ', '\r'], "");

    // remove 0x prefix if present
    let bytecode_string = bytecode_string
        .strip_prefix("0x")
        .map(str::to_string)
        .unwrap_or(bytecode_string);

    let output_handler = OutputHandler::new(
        args.verbosity > 0,
        args.disassemble,
        args.segments,
        args.raw,
    );
    let bytecode_vec = hex::decode(&bytecode_string).wrap_err("bytecode is not valid hex")?;

    let config = AnalysisConfig {
        max_depth: args.max_depth,
        ..Default::default()
    };
    let analysis_time = std::time::Instant::now();
    let analysis = analyze(&bytecode_vec, &config).wrap_err("cfg construction failed")?;
    if output_handler.show_timings {
        println!("analysis took: {:?}", analysis_time.elapsed());
    }

    if output_handler.show_instructions {
        for ins in &analysis.instructions {
            let marker = if ins.is_valid() { "" } else { "  (truncated)" };
            println!("{ins:?}{marker}");
        }
    }
    if output_handler.show_segments {
        for (index, seg) in analysis.segments.iter().enumerate() {
            println!(
                "#{index} ops:{} cap:{} wpre-operands:{} wpre-capacity:{}",
                seg.net_op_effect(),
                seg.net_cap_effect(),
                seg.weakest_pre_operands(0),
                seg.weakest_pre_capacity(0)
            );
            print!("{seg}");
        }
        println!("jumpdests: {:?}", collect_jump_dests(&analysis.segments));
    }

    let raw_dot = analysis.raw_cfg.cfg_dot_str_with_segments(&analysis.segments);
    let dot = analysis.cfg.cfg_dot_str_with_segments(&analysis.segments);
    if let Some(filename) = &args.output {
        if output_handler.show_raw_cfg {
            write_dot("cfg_raw.dot", &raw_dot)?;
        }
        write_dot(filename, &dot)?;
    } else {
        if output_handler.show_raw_cfg {
            println!("{raw_dot}");
        }
        println!("{dot}");
    }
    Ok(())
}
