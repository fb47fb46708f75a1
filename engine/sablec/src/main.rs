//! Sable CLI.
//!
//! `sable <command> <file> [flags]` — parse-check, format, convert between
//! the canonical text form and JSON, and pack/unpack the binary form.

use sable_ir::{default_pool, NodeId, NodeKind, NodeManager};
use sable_parse::{parse_with_options, unparse, ParseOptions};
use std::path::Path;
use std::process::ExitCode;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return ExitCode::FAILURE;
    }

    let command = args[1].as_str();
    let mut path: Option<&str> = None;
    let mut flags = Flags::default();
    for arg in args.iter().skip(2) {
        match arg.as_str() {
            "--debug-sources" => flags.debug_sources = true,
            "--warn-on-undefined" => flags.warn_on_undefined = true,
            "--pretty" => flags.pretty = true,
            other if !other.starts_with('-') && path.is_none() => path = Some(other),
            other => {
                eprintln!("unknown flag {other:?}");
                return ExitCode::FAILURE;
            }
        }
    }

    let Some(path) = path else {
        eprintln!("missing input file");
        print_usage();
        return ExitCode::FAILURE;
    };

    let outcome = match command {
        "check" => check_file(path, &flags),
        "fmt" => format_file(path, &flags),
        "convert" => convert_file(path, &flags),
        "pack" => pack_file(path),
        "unpack" => unpack_file(path),
        other => {
            eprintln!("unknown command {other:?}");
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Default)]
struct Flags {
    debug_sources: bool,
    warn_on_undefined: bool,
    pretty: bool,
}

fn print_usage() {
    eprintln!("Usage: sable <command> <file> [flags]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  check    Parse the file and report problems");
    eprintln!("  fmt      Reprint the file in canonical form");
    eprintln!("  convert  Convert .sbl to JSON or .json to canonical form");
    eprintln!("  pack     Compress the file into <file>.sblp");
    eprintln!("  unpack   Decompress a .sblp file to stdout");
    eprintln!();
    eprintln!("Flags:");
    eprintln!("  --debug-sources     Annotate parse trees with source locations");
    eprintln!("  --warn-on-undefined Warn when a symbol has no defining label");
    eprintln!("  --pretty            Indent output where applicable");
}

fn read_source(path: &str) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("cannot read {path}: {e}"))
}

fn parse_source(
    source: &str,
    manager: &mut NodeManager,
    flags: &Flags,
) -> Result<sable_ir::NodeRef, String> {
    let options = ParseOptions {
        debug_sources: flags.debug_sources,
    };
    parse_with_options(source, manager, &options).map_err(|e| e.to_string())
}

fn check_file(path: &str, flags: &Flags) -> Result<(), String> {
    let source = read_source(path)?;
    let mut manager = NodeManager::new(default_pool());
    let root = parse_source(&source, &mut manager, flags)?;

    if flags.warn_on_undefined {
        for symbol in undefined_symbols(&manager, root.id) {
            eprintln!("warning: undefined symbol {symbol:?}");
        }
    }
    println!("{path}: ok ({} nodes)", manager.deep_size(root.id));
    Ok(())
}

/// Symbols with no label of the same name anywhere in the tree.
fn undefined_symbols(manager: &NodeManager, root: NodeId) -> Vec<String> {
    let mut defined: Vec<sable_intern::StringId> = Vec::new();
    let mut symbols: Vec<sable_intern::StringId> = Vec::new();
    let mut stack = vec![root];
    let mut visited = sable_sets::BitSet::new();
    while let Some(id) = stack.pop() {
        if !visited.insert(id.index()) {
            continue;
        }
        let node = manager.get(id);
        defined.extend(node.labels().iter().copied());
        if node.kind() == NodeKind::Symbol {
            if let Some(sid) = node.string_id() {
                symbols.push(sid);
            }
        }
        stack.extend(node.child_ids());
    }

    let mut out: Vec<String> = symbols
        .into_iter()
        .filter(|symbol| !defined.contains(symbol))
        .map(|symbol| manager.pool().get(symbol))
        .collect();
    out.sort();
    out.dedup();
    out
}

fn format_file(path: &str, flags: &Flags) -> Result<(), String> {
    let source = read_source(path)?;
    let mut manager = NodeManager::new(default_pool());
    let root = parse_source(&source, &mut manager, flags)?;
    println!("{}", unparse(&manager, root.id, flags.pretty, true));
    Ok(())
}

fn convert_file(path: &str, flags: &Flags) -> Result<(), String> {
    let source = read_source(path)?;
    let mut manager = NodeManager::new(default_pool());

    if Path::new(path).extension().is_some_and(|ext| ext == "json") {
        let root = sable_ir::from_json_str(&source, &mut manager).map_err(|e| e.to_string())?;
        println!("{}", unparse(&manager, root.id, flags.pretty, true));
    } else {
        let root = parse_source(&source, &mut manager, flags)?;
        let json =
            sable_ir::to_json_string(&manager, root.id, flags.pretty).map_err(|e| e.to_string())?;
        println!("{json}");
    }
    Ok(())
}

fn pack_file(path: &str) -> Result<(), String> {
    let data = std::fs::read(path).map_err(|e| format!("cannot read {path}: {e}"))?;
    let packed = sable_pack::compress(&data);
    let out_path = format!("{path}.sblp");
    std::fs::write(&out_path, &packed).map_err(|e| format!("cannot write {out_path}: {e}"))?;
    tracing::info!(
        input = data.len(),
        output = packed.len(),
        "packed {path} -> {out_path}"
    );
    println!("{out_path}: {} -> {} bytes", data.len(), packed.len());
    Ok(())
}

fn unpack_file(path: &str) -> Result<(), String> {
    let data = std::fs::read(path).map_err(|e| format!("cannot read {path}: {e}"))?;
    let unpacked = sable_pack::decompress(&data).map_err(|e| e.to_string())?;
    let mut stdout = std::io::stdout().lock();
    std::io::Write::write_all(&mut stdout, &unpacked).map_err(|e| e.to_string())?;
    Ok(())
}
