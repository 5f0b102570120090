use anyhow::{anyhow, bail, Context, Result};
use bpgen_core::chunk_format::read_header;
use bpgen_core::paths::PathPolicy;
use bpgen_core::settings::GenerationSettings;
use bpgen_core::verify::verify_with_policy;
use bpgen_core::GenerationSession;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bpgen", version, about = "Build patch chunk generator")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Chunk a build directory and write its manifest to the cloud directory
    Generate(GenerateArgs),
    /// Rebuild every file of a manifest from its chunks and compare to a build root
    Verify {
        manifest: PathBuf,
        cloud_dir: PathBuf,
        root: PathBuf,
        #[arg(long, default_value_t = false)]
        follow_symlinks: bool,
    },
    /// Print the header of a chunk file
    Inspect { chunk: PathBuf },
}

#[derive(Args)]
struct GenerateArgs {
    /// JSON settings file supplying defaults for every flag below
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long)]
    cloud_dir: Option<PathBuf>,
    #[arg(long)]
    app_id: Option<u32>,
    #[arg(long)]
    app_name: Option<String>,
    #[arg(long)]
    build_version: Option<String>,
    #[arg(long)]
    launch_exe: Option<String>,
    #[arg(long)]
    launch_command: Option<String>,
    #[arg(long)]
    ignore_list: Option<PathBuf>,
    /// Extra manifest field, KEY=VALUE (numbers and true/false are typed)
    #[arg(long = "custom", value_name = "KEY=VALUE")]
    custom: Vec<String>,
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long)]
    cache_capacity: Option<usize>,
    #[arg(long, default_value_t = false)]
    no_compress: bool,
    /// Seconds between progress lines (0 = off)
    #[arg(long)]
    progress_interval: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.cmd {
        Cmd::Generate(args) => generate(args)?,
        Cmd::Verify { manifest, cloud_dir, root, follow_symlinks } => {
            verify(&manifest, &cloud_dir, &root, follow_symlinks)?
        }
        Cmd::Inspect { chunk } => inspect(&chunk)?,
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn settings_from_args(args: GenerateArgs) -> Result<GenerationSettings> {
    let mut s = match &args.settings {
        Some(p) => GenerationSettings::load(p)?,
        None => {
            let root = args.root.clone().ok_or_else(|| anyhow!("--root is required"))?;
            let cloud = args.cloud_dir.clone().ok_or_else(|| anyhow!("--cloud-dir is required"))?;
            let app_id = args.app_id.ok_or_else(|| anyhow!("--app-id is required"))?;
            let name = args.app_name.clone().ok_or_else(|| anyhow!("--app-name is required"))?;
            let version =
                args.build_version.clone().ok_or_else(|| anyhow!("--build-version is required"))?;
            GenerationSettings::new(root, cloud, app_id, name, version)
        }
    };
    if let Some(v) = args.root {
        s.root_directory = v;
    }
    if let Some(v) = args.cloud_dir {
        s.cloud_directory = v;
    }
    if let Some(v) = args.app_id {
        s.app_id = v;
    }
    if let Some(v) = args.app_name {
        s.app_name = v;
    }
    if let Some(v) = args.build_version {
        s.build_version = v;
    }
    if let Some(v) = args.launch_exe {
        s.launch_exe = v;
    }
    if let Some(v) = args.launch_command {
        s.launch_command = v;
    }
    if let Some(v) = args.ignore_list {
        s.ignore_list_file = Some(v);
    }
    for kv in &args.custom {
        let (k, v) = parse_custom(kv)?;
        s.custom_fields.insert(k, v);
    }
    if let Some(v) = args.chunk_size {
        s.chunking.chunk_size = v;
    }
    if let Some(v) = args.cache_capacity {
        s.chunking.cache_capacity = v;
    }
    if args.no_compress {
        s.chunking.compress = false;
    }
    if let Some(v) = args.progress_interval {
        s.chunking.progress_interval_secs = v;
    }
    Ok(s)
}

fn parse_custom(kv: &str) -> Result<(String, serde_json::Value)> {
    let (k, v) = kv.split_once('=').ok_or_else(|| anyhow!("bad --custom {:?}, want KEY=VALUE", kv))?;
    if k.is_empty() {
        bail!("bad --custom {:?}, empty key", kv);
    }
    let value = if let Ok(i) = v.parse::<i64>() {
        serde_json::Value::from(i)
    } else if let Some(f) = v.parse::<f64>().ok().filter(|f| f.is_finite()) {
        serde_json::Value::from(f)
    } else if let Ok(b) = v.parse::<bool>() {
        serde_json::Value::from(b)
    } else {
        serde_json::Value::from(v)
    };
    Ok((k.to_string(), value))
}

fn generate(args: GenerateArgs) -> Result<()> {
    let settings = settings_from_args(args)?;
    tracing::debug!(?settings, "resolved generation settings");
    let session = GenerationSession::new(settings)?;
    let rep = session.run()?;
    println!("Manifest: {}", rep.manifest_path.display());
    println!(
        "Files: {} ({} empty, {} ignored)",
        rep.files, rep.empty_files, rep.ignored_files
    );
    println!("Bytes: {}", rep.bytes_processed);
    println!("Chunks: new={} known={} written={}", rep.new_chunks, rep.known_chunks, rep.chunks_written);
    Ok(())
}

fn verify(manifest: &Path, cloud_dir: &Path, root: &Path, follow_symlinks: bool) -> Result<()> {
    let policy = PathPolicy { follow_symlinks };
    let rep = verify_with_policy(manifest, cloud_dir, root, policy)?;
    eprintln!(
        "Files ok={}, bad={}; chunks missing={}",
        rep.files_ok, rep.files_bad, rep.chunks_missing
    );
    if rep.is_ok() {
        println!("OK");
        Ok(())
    } else {
        for f in &rep.bad_files {
            println!("BAD {}", f);
        }
        bail!("{} file(s) do not match the manifest", rep.files_bad.max(1))
    }
}

fn inspect(chunk: &Path) -> Result<()> {
    let h = read_header(chunk).with_context(|| format!("inspect {}", chunk.display()))?;
    println!("id:           {}", h.id);
    println!("version:      {}", h.header_version);
    println!("header size:  {}", h.header_size);
    println!("hash kind:    {:?}", h.hash_kind);
    println!("stored as:    {:?}", h.stored_as);
    println!("rolling hash: {:016x}", h.rolling_hash);
    println!("payload:      {} bytes", h.payload_len);
    println!("stored:       {} bytes", h.stored_len);
    Ok(())
}
