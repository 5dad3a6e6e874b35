use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use patchgen::patch::{ArchReg, GeneratedPatch, PatchGenerator, UNTAGGED};
use patchgen::rulefile::RuleFile;
use patchgen::target::{AArch64, ContextLayout, Target, X86_64};
use patchgen::TargetArch;

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ArchArg {
    #[value(name = "x86_64")]
    X86_64,
    #[value(name = "aarch64", alias = "arm64")]
    AArch64,
}

impl From<ArchArg> for TargetArch {
    fn from(arg: ArchArg) -> Self {
        match arg {
            ArchArg::X86_64 => TargetArch::X86_64,
            ArchArg::AArch64 => TargetArch::AArch64,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum FormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "patchgen")]
#[command(about = "Generate instrumentation patches for one instruction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the patch described by a TOML file
    Generate {
        /// The patch description file
        file: PathBuf,

        /// Output format (human, json)
        #[arg(long, value_enum, default_value = "human")]
        format: FormatArg,

        /// Address the code is placed at (relocates the output)
        #[arg(long, value_parser = parse_u64, requires = "data_addr")]
        code_addr: Option<u64>,

        /// Address of the data block (relocates the output)
        #[arg(long, value_parser = parse_u64, requires = "code_addr")]
        data_addr: Option<u64>,

        /// Log every lowered operation
        #[arg(long)]
        trace: bool,
    },
    /// Print the register table and context layout of a target
    Layout {
        /// Target architecture (x86_64, aarch64)
        #[arg(long, value_enum)]
        arch: ArchArg,

        /// Output format (human, json)
        #[arg(long, value_enum, default_value = "human")]
        format: FormatArg,
    },
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn init_tracing(trace: bool) {
    let level = if trace {
        tracing::Level::TRACE
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Generate {
            file,
            format,
            code_addr,
            data_addr,
            trace,
        } => {
            let placement = code_addr.zip(data_addr);
            generate(&file, format, placement, trace)
        }
        Commands::Layout { arch, format } => {
            init_tracing(false);
            match TargetArch::from(arch) {
                TargetArch::X86_64 => print_layout::<X86_64>(format),
                TargetArch::AArch64 => print_layout::<AArch64>(format),
            }
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn generate(
    path: &Path,
    format: FormatArg,
    placement: Option<(u64, u64)>,
    trace: bool,
) -> Result<(), String> {
    let mut file = RuleFile::load(path)?;
    file.generation.trace |= trace;
    init_tracing(file.generation.trace);

    match file.target.arch {
        TargetArch::X86_64 => generate_for::<X86_64>(&file, format, placement),
        TargetArch::AArch64 => generate_for::<AArch64>(&file, format, placement),
    }
}

#[derive(Serialize)]
struct GenerateReport<'a> {
    #[serde(flatten)]
    patch: &'a GeneratedPatch,
    #[serde(skip_serializing_if = "Option::is_none")]
    relocated: Option<Relocated>,
}

#[derive(Serialize)]
struct Relocated {
    code_addr: u64,
    data_addr: u64,
    code: Vec<u8>,
}

fn generate_for<T: Target>(
    file: &RuleFile,
    format: FormatArg,
    placement: Option<(u64, u64)>,
) -> Result<(), String> {
    let job = file.build::<T>()?;
    let mut generator = PatchGenerator::<T>::new(file.generation.clone());
    let patch = generator
        .generate(&job.inst, &job.patch, &job.rules)
        .map_err(|e| format!("{} ({:?} error)", e, e.kind()))?;

    let relocated = match placement {
        Some((code_addr, data_addr)) => Some(Relocated {
            code_addr,
            data_addr,
            code: patch
                .relocate(code_addr, data_addr)
                .map_err(|e| e.to_string())?,
        }),
        None => None,
    };

    match format {
        FormatArg::Json => {
            let report = GenerateReport {
                patch: &patch,
                relocated,
            };
            let json = serde_json::to_string_pretty(&report)
                .map_err(|e| format!("failed to serialize patch: {}", e))?;
            println!("{}", json);
        }
        FormatArg::Human => print_patch::<T>(&patch, relocated.as_ref()),
    }
    Ok(())
}

fn hex_line(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_patch<T: Target>(patch: &GeneratedPatch, relocated: Option<&Relocated>) {
    let code = relocated.map_or(patch.code.as_slice(), |r| r.code.as_slice());

    println!(
        "patch for {:#x} ({}), {} bytes",
        patch.address,
        patch.arch,
        code.len()
    );
    if let Some(r) = relocated {
        println!("relocated: code at {:#x}, data at {:#x}", r.code_addr, r.data_addr);
    }

    for (tag, range) in patch.segments() {
        println!("  {}", tag);
        let mut offset = range.start;
        for chunk in code[range].chunks(16) {
            println!("    {:04x}: {}", offset, hex_line(chunk));
            offset += chunk.len();
        }
    }

    if !patch.fixups.is_empty() {
        println!("fixups:");
        for fixup in &patch.fixups {
            println!("  {:04x}: data+{:#x}", fixup.at, fixup.data_offset);
        }
    }

    if !patch.shadows.is_empty() {
        println!("shadows:");
        for cell in &patch.shadows {
            if cell.tag == UNTAGGED {
                println!("  data+{:#x}: untagged", cell.offset);
            } else {
                println!("  data+{:#x}: tag {:#06x}", cell.offset, cell.tag);
            }
        }
    }

    if !patch.temps.is_empty() {
        println!("temps:");
        for segment in &patch.temps {
            for binding in &segment.bindings {
                println!(
                    "  {}: {} = {}",
                    segment.segment,
                    binding.temp,
                    T::reg_name(binding.reg)
                );
            }
        }
    }
}

#[derive(Serialize)]
struct LayoutReport {
    arch: &'static str,
    word_size: usize,
    context: ContextLayout,
    context_size: usize,
    host_fields: Vec<Field>,
    gprs: Vec<Gpr>,
    fpr_base: usize,
    scratch_pool: Vec<&'static str>,
    reserved: Vec<&'static str>,
}

#[derive(Serialize)]
struct Field {
    name: &'static str,
    offset: usize,
}

#[derive(Serialize)]
struct Gpr {
    slot: usize,
    name: &'static str,
    arch: ArchReg,
    offset: usize,
}

fn reg_names<T: Target>(regs: &[ArchReg]) -> Vec<&'static str> {
    regs.iter()
        .filter_map(|reg| T::GPR_ID.iter().position(|r| r == reg))
        .map(|slot| T::GPR_NAMES[slot])
        .collect()
}

fn layout_report<T: Target>() -> LayoutReport {
    let layout = T::CONTEXT;
    LayoutReport {
        arch: T::NAME,
        word_size: T::WORD_SIZE,
        context: layout,
        context_size: layout.size(),
        host_fields: T::HOST_FIELDS
            .iter()
            .enumerate()
            .map(|(i, &name)| Field {
                name,
                offset: i * T::WORD_SIZE,
            })
            .collect(),
        gprs: T::GPR_ID
            .iter()
            .enumerate()
            .map(|(slot, arch)| Gpr {
                slot,
                name: T::GPR_NAMES[slot],
                arch: *arch,
                offset: layout.gpr_offset(slot),
            })
            .collect(),
        fpr_base: layout.fpr_base(),
        scratch_pool: reg_names::<T>(T::SCRATCH_POOL),
        reserved: reg_names::<T>(T::RESERVED),
    }
}

fn print_layout<T: Target>(format: FormatArg) -> Result<(), String> {
    let report = layout_report::<T>();

    if format == FormatArg::Json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| format!("failed to serialize layout: {}", e))?;
        println!("{}", json);
        return Ok(());
    }

    println!("{} (word size {})", report.arch, report.word_size);
    println!("context: {} bytes", report.context_size);
    println!("host state:");
    for field in &report.host_fields {
        println!("  {:#06x}  {}", field.offset, field.name);
    }
    println!("gpr:");
    for gpr in &report.gprs {
        println!(
            "  {:#06x}  slot {:>2}  {:<7} {}",
            gpr.offset, gpr.slot, gpr.name, gpr.arch
        );
    }
    println!("fpr: {:#06x}", report.fpr_base);
    println!("scratch pool: {}", report.scratch_pool.join(" "));
    if !report.reserved.is_empty() {
        println!("reserved: {}", report.reserved.join(" "));
    }
    Ok(())
}
