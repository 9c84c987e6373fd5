// Command-line front end for oxipatch.
//
// Subcommands apply a patch to a ROM, create a patch from two images,
// report on a patch or ROM, and print the build configuration.

use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};

use crate::engine::{self, ApplyOptions, PatchFormat};
use crate::error::PatchError;
use crate::formats::{BpsMode, BuildOptions, PatchMetadata};
use crate::io;

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// ROM patcher for IPS, UPS, BPS, APS, PPF, RUP, BDF, PMSR and VCDIFF.
#[derive(Parser, Debug)]
#[command(
    name = "oxipatch",
    version,
    about = "Apply and create ROM patches",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Force overwrite existing output files.
    #[arg(short = 'f', long, global = true)]
    force: bool,

    /// Quiet mode (suppress non-error output).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use multiple times for more detail).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Output results as JSON on stdout.
    #[arg(long = "json", global = true)]
    json_output: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Apply a patch to a ROM.
    Apply(ApplyArgs),
    /// Create a patch from an original and a modified ROM.
    Create(CreateArgs),
    /// Describe a patch file, or report digests for a ROM.
    Info(InfoArgs),
    /// Print build/configuration details.
    Config,
}

/// Formats `create` can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Ips,
    Ebp,
    Ups,
    Bps,
    #[value(alias = "aps-n64")]
    Aps,
    Ppf,
    Rup,
    #[value(alias = "vcdiff")]
    Xdelta,
}

impl From<FormatArg> for PatchFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Ips => PatchFormat::Ips,
            FormatArg::Ebp => PatchFormat::Ebp,
            FormatArg::Ups => PatchFormat::Ups,
            FormatArg::Bps => PatchFormat::Bps,
            FormatArg::Aps => PatchFormat::ApsN64,
            FormatArg::Ppf => PatchFormat::Ppf,
            FormatArg::Rup => PatchFormat::Rup,
            FormatArg::Xdelta => PatchFormat::Vcdiff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BpsModeArg {
    Auto,
    Linear,
    Delta,
}

impl From<BpsModeArg> for BpsMode {
    fn from(arg: BpsModeArg) -> Self {
        match arg {
            BpsModeArg::Auto => BpsMode::Auto,
            BpsModeArg::Linear => BpsMode::Linear,
            BpsModeArg::Delta => BpsMode::Delta,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct ApplyArgs {
    /// Patch file.
    #[arg(value_hint = ValueHint::FilePath)]
    patch: PathBuf,

    /// ROM to patch.
    #[arg(value_hint = ValueHint::FilePath)]
    rom: PathBuf,

    /// Output file (default: "<rom> (patched).<ext>" next to the ROM).
    #[arg(long, short = 'o', value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Skip source and target checksum validation.
    #[arg(long = "no-validate")]
    no_validate: bool,

    /// Patch the body of a headered ROM and keep its header.
    #[arg(long = "strip-header", conflicts_with = "fake_header")]
    strip_header: bool,

    /// Patch a headerless ROM as if it had a header.
    #[arg(long = "fake-header")]
    fake_header: bool,

    /// Fix Game Boy / Mega Drive internal checksums after patching.
    #[arg(long = "fix-checksum")]
    fix_checksum: bool,

    /// Keep the ROM's name for the default output.
    #[arg(long = "no-suffix")]
    no_suffix: bool,
}

#[derive(Args, Debug, Clone)]
struct CreateArgs {
    /// Original (unmodified) ROM.
    #[arg(value_hint = ValueHint::FilePath)]
    original: PathBuf,

    /// Modified ROM.
    #[arg(value_hint = ValueHint::FilePath)]
    modified: PathBuf,

    /// Patch format to write.
    #[arg(long, short = 'F', value_enum, default_value_t = FormatArg::Bps)]
    format: FormatArg,

    /// Output file (default: the modified ROM's name with the format's extension).
    #[arg(long, short = 'o', value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// BPS builder.
    #[arg(long = "bps-mode", value_enum, default_value_t = BpsModeArg::Auto)]
    bps_mode: BpsModeArg,

    #[arg(long)]
    title: Option<String>,

    #[arg(long)]
    author: Option<String>,

    #[arg(long)]
    description: Option<String>,

    /// Do not re-apply the built patch to check it.
    #[arg(long = "no-verify")]
    no_verify: bool,
}

#[derive(Args, Debug, Clone)]
struct InfoArgs {
    /// Patch or ROM file.
    #[arg(value_hint = ValueHint::FilePath)]
    file: PathBuf,

    /// Treat the file as a ROM even if it looks like a patch.
    #[arg(long)]
    rom: bool,
}

// ---------------------------------------------------------------------------
// Resolved options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Command {
    Apply(ApplyArgs),
    Create(CreateArgs),
    Info(InfoArgs),
    Config,
}

#[derive(Debug, Clone)]
struct Options {
    command: Command,
    force: bool,
    quiet: bool,
    verbose: u8,
    json_output: bool,
}

fn resolve_options(cli: Cli) -> Options {
    Options {
        command: match cli.command {
            Cmd::Apply(args) => Command::Apply(args),
            Cmd::Create(args) => Command::Create(args),
            Cmd::Info(args) => Command::Info(args),
            Cmd::Config => Command::Config,
        },
        force: cli.force,
        quiet: cli.quiet,
        verbose: cli.verbose.min(2),
        json_output: cli.json_output,
    }
}

impl Options {
    fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "info",
            _ => "debug",
        }
    }
}

#[cfg(any(test, feature = "fuzzing"))]
pub fn fuzz_try_parse_args(args: &[String]) {
    let argv: Vec<String> = std::iter::once("oxipatch".to_string())
        .chain(args.iter().cloned())
        .collect();
    if let Ok(cli) = Cli::try_parse_from(argv) {
        let _ = resolve_options(cli);
    }
}

fn check_output(path: &Path, force: bool) -> bool {
    if path.exists() && !force {
        eprintln!(
            "oxipatch: output file exists, use -f to overwrite: {}",
            path.display()
        );
        return false;
    }
    true
}

fn print_json(value: &impl serde::Serialize) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            eprintln!("oxipatch: json: {e}");
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Config command
// ---------------------------------------------------------------------------

fn cmd_config() -> i32 {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("oxipatch version {version} (Rust)");

    let adler32 = cfg!(feature = "adler32") as u8;
    let file_io = cfg!(feature = "file-io") as u8;
    eprintln!("ADLER32={adler32}");
    eprintln!("FILE_IO={file_io}");
    eprintln!("ROM_SIZE_LIMIT={:#x}", engine::ROM_SIZE_LIMIT);
    eprintln!("BPS_DELTA_AUTO_LIMIT={}", crate::formats::bps::DELTA_AUTO_LIMIT);
    eprintln!("VCDIFF_BUILD_WINDOW={}", crate::formats::vcdiff::BUILD_WINDOW);

    for format in PatchFormat::ALL {
        let build = if format.can_build() { "apply, create" } else { "apply" };
        eprintln!("  {:<10} .{:<7} {build}", format.name(), format.extension());
    }
    0
}

// ---------------------------------------------------------------------------
// Apply command
// ---------------------------------------------------------------------------

fn cmd_apply(opts: &Options, args: &ApplyArgs) -> i32 {
    let output = match &args.output {
        Some(path) => path.clone(),
        None if args.no_suffix => args.rom.clone(),
        None => io::default_output_path(&args.rom),
    };
    if !check_output(&output, opts.force) {
        return 1;
    }

    let options = ApplyOptions {
        require_source_validation: !args.no_validate,
        strip_header: args.strip_header,
        inject_fake_header: args.fake_header,
        fix_checksum: args.fix_checksum,
        name_suffix: !args.no_suffix,
        file_name: args
            .rom
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
    };

    let stats = match io::apply_file(&args.rom, &args.patch, Some(&output), &options) {
        Ok(stats) => stats,
        Err(PatchError::ChecksumMismatch { stage }) => {
            eprintln!(
                "oxipatch: {stage} checksum mismatch; the ROM may be the wrong revision \
                 (use --no-validate to patch anyway)"
            );
            return 1;
        }
        Err(e) => {
            eprintln!("oxipatch: apply: {e}");
            return 1;
        }
    };

    if opts.json_output {
        return print_json(&serde_json::json!({
            "command": "apply",
            "stats": stats,
        }));
    }
    if !opts.quiet {
        eprintln!(
            "oxipatch: applied {} patch: {} -> {} ({} bytes, crc32 {})",
            stats.format,
            args.rom.display(),
            stats.output_path.display(),
            stats.output_size,
            stats.output_crc32
        );
    }
    if opts.verbose > 0 && !opts.quiet {
        if let Some(header) = &stats.header {
            eprintln!("oxipatch: header: {header}");
        }
        if let Some(system) = stats.checksum_fixed {
            eprintln!("oxipatch: fixed {system:?} checksum");
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Create command
// ---------------------------------------------------------------------------

fn cmd_create(opts: &Options, args: &CreateArgs) -> i32 {
    let format = PatchFormat::from(args.format);
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.modified.with_extension(format.extension()));
    if !check_output(&output, opts.force) {
        return 1;
    }

    let options = BuildOptions {
        verify: !args.no_verify,
        bps_mode: args.bps_mode.into(),
        metadata: PatchMetadata {
            title: args.title.clone(),
            author: args.author.clone(),
            description: args.description.clone(),
        },
    };

    let stats = match io::create_file(&args.original, &args.modified, &output, format, &options) {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("oxipatch: create: {e}");
            return 1;
        }
    };

    if opts.json_output {
        return print_json(&serde_json::json!({
            "command": "create",
            "output": output,
            "stats": stats,
        }));
    }
    if !opts.quiet {
        eprintln!(
            "oxipatch: wrote {} patch {} ({} bytes)",
            stats.format,
            output.display(),
            stats.patch_size
        );
    }
    if opts.verbose > 0 && !opts.quiet {
        eprintln!(
            "oxipatch: original size: {}, modified size: {}, verified: {}",
            stats.original_size, stats.modified_size, stats.verified
        );
    }
    0
}

// ---------------------------------------------------------------------------
// Info command
// ---------------------------------------------------------------------------

fn cmd_info(opts: &Options, args: &InfoArgs) -> i32 {
    let data = match std::fs::read(&args.file) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("oxipatch: {}: {e}", args.file.display());
            return 1;
        }
    };

    if !args.rom {
        match engine::detect_and_parse(&data) {
            Ok(patch) => {
                if opts.json_output {
                    return print_json(&serde_json::json!({
                        "command": "info",
                        "kind": "patch",
                        "format": patch.format(),
                        "info": patch.info(),
                    }));
                }
                for (key, value) in patch.describe() {
                    println!("{key:<24} {value}");
                }
                return 0;
            }
            Err(PatchError::UnrecognizedFormat) => {
                log::info!("not a known patch format; reporting as a ROM");
            }
            Err(e) => {
                eprintln!("oxipatch: invalid patch: {e}");
                return 1;
            }
        }
    }

    let name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let info = io::rom_info(&data, &name);
    if opts.json_output {
        return print_json(&serde_json::json!({
            "command": "info",
            "kind": "rom",
            "info": info,
        }));
    }

    println!("{:<24} {}", "size", info.size);
    println!("{:<24} {}", "crc32", info.crc32);
    println!("{:<24} {}", "md5", info.md5);
    println!("{:<24} {}", "sha1", info.sha1);
    if let Some(sha256) = &info.sha256 {
        println!("{:<24} {sha256}", "sha256");
    }
    if let Some(system) = info.system {
        println!("{:<24} {system:?}", "system");
    }
    if let Some(header) = info.header {
        println!("{:<24} {header}", "header");
    }
    if let Some(n64) = &info.n64 {
        println!("{:<24} {}", "n64 cart id", n64.cart_id);
        println!("{:<24} {}", "n64 header crc", n64.header_crc);
    }
    if info.too_big {
        println!("{:<24} yes", "too big");
    }
    0
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Main CLI entry point. Parses arguments via clap, dispatches commands.
pub fn run() -> ! {
    let cli = Cli::parse();
    let opts = resolve_options(cli);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(opts.log_level()))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let exit_code = match &opts.command {
        Command::Apply(args) => cmd_apply(&opts, args),
        Command::Create(args) => cmd_create(&opts, args),
        Command::Info(args) => cmd_info(&opts, args),
        Command::Config => cmd_config(),
    };

    process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_opts(args: &[&str]) -> Options {
        let argv: Vec<String> = std::iter::once("oxipatch".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        let cli = Cli::try_parse_from(argv).expect("cli parse failed");
        resolve_options(cli)
    }

    #[test]
    fn apply_subcommand_maps_correctly() {
        let opts = parse_opts(&[
            "apply",
            "hack.bps",
            "game.sfc",
            "--output",
            "out.sfc",
            "--strip-header",
            "--fix-checksum",
            "--no-validate",
        ]);
        let Command::Apply(args) = opts.command else {
            panic!("expected apply");
        };
        assert_eq!(args.patch, PathBuf::from("hack.bps"));
        assert_eq!(args.rom, PathBuf::from("game.sfc"));
        assert_eq!(args.output, Some(PathBuf::from("out.sfc")));
        assert!(args.strip_header && args.fix_checksum && args.no_validate);
        assert!(!args.fake_header);
    }

    #[test]
    fn header_flags_conflict() {
        let argv = ["oxipatch", "apply", "p.ips", "r.nes", "--strip-header", "--fake-header"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn create_subcommand_maps_correctly() {
        let opts = parse_opts(&[
            "create",
            "orig.gba",
            "mod.gba",
            "--format",
            "ebp",
            "--title",
            "My Hack",
            "--bps-mode",
            "linear",
            "--no-verify",
        ]);
        let Command::Create(args) = opts.command else {
            panic!("expected create");
        };
        assert_eq!(PatchFormat::from(args.format), PatchFormat::Ebp);
        assert_eq!(BpsMode::from(args.bps_mode), BpsMode::Linear);
        assert_eq!(args.title.as_deref(), Some("My Hack"));
        assert!(args.no_verify);
    }

    #[test]
    fn create_defaults_to_bps() {
        let Command::Create(args) = parse_opts(&["create", "a", "b"]).command else {
            panic!("expected create");
        };
        assert_eq!(args.format, FormatArg::Bps);
        assert_eq!(args.bps_mode, BpsModeArg::Auto);
    }

    #[test]
    fn format_aliases() {
        let Command::Create(args) =
            parse_opts(&["create", "a", "b", "--format", "vcdiff"]).command
        else {
            panic!("expected create");
        };
        assert_eq!(PatchFormat::from(args.format), PatchFormat::Vcdiff);
        assert!(Cli::try_parse_from(["oxipatch", "create", "a", "b", "-F", "bdf"]).is_err());
    }

    #[test]
    fn global_flags() {
        let opts = parse_opts(&["--force", "--json", "info", "x.ips"]);
        assert!(opts.force && opts.json_output);
        assert!(matches!(opts.command, Command::Info(_)));
    }

    #[test]
    fn verbose_is_capped() {
        let opts = parse_opts(&["-vvv", "config"]);
        assert_eq!(opts.verbose, 2);
        assert_eq!(opts.log_level(), "debug");
        assert_eq!(parse_opts(&["-q", "config"]).log_level(), "error");
        assert_eq!(parse_opts(&["config"]).log_level(), "warn");
    }

    #[test]
    fn fuzz_hook_tolerates_garbage() {
        fuzz_try_parse_args(&["apply".into(), "--bogus".into()]);
        fuzz_try_parse_args(&[]);
    }
}
