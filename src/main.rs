use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use cs2dynarec::memory::modules::ModuleResolver;
use cs2dynarec::{
    load_image, CacheClient, CacheServer, Dynarec, DynarecConfig, ExecContext, FlatMemory, MemoryStore, ModuleId,
    ModuleMap,
};

#[derive(Parser, Debug)]
#[command(name = "cs2dynarec", about = "Dynarec block manager with a shared code cache")]
struct Args {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate every block reachable from an entry point of an RV32 image
    Translate {
        /// Raw, .gz or .zst guest image
        image: PathBuf,

        /// Guest load address
        #[arg(long, value_parser = parse_addr, default_value = "0x10000")]
        base: u64,

        /// Module name the image is registered under
        #[arg(long)]
        module: Option<String>,

        /// First guest address to translate (defaults to --base)
        #[arg(long, value_parser = parse_addr)]
        entry: Option<u64>,

        /// Cache server address; enables the shared code cache
        #[arg(long, value_name = "ADDR")]
        cache: Option<String>,
    },
    /// Run the reference cache server
    Serve {
        #[arg(long, default_value = "127.0.0.1:7878")]
        listen: String,
    },
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let res = match args.command {
        Command::Translate {
            image,
            base,
            module,
            entry,
            cache,
        } => translate(image, base, module, entry.unwrap_or(base), cache),
        Command::Serve { listen } => serve(&listen),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn translate(
    image: PathBuf,
    base: u64,
    module: Option<String>,
    entry: u64,
    cache: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = load_image(&fs::read(&image)?)?;
    let len = bytes.len() as u64;
    let module = ModuleId::new(module.unwrap_or_else(|| image.display().to_string()));
    info!(image = %image.display(), base = format_args!("{base:#x}"), len, %module, "loaded image");

    let mem = Arc::new(FlatMemory::new(base, bytes));
    let modules = Arc::new(ModuleMap::new());
    modules.insert(module.clone(), base, len, 0);

    let mut config = DynarecConfig::from_env()?;
    let mut builder = Dynarec::builder(mem).modules(modules.clone() as Arc<dyn ModuleResolver>);
    if let Some(addr) = cache.or_else(|| config.cs2c_server.clone()) {
        let client = CacheClient::connect(&addr)?;
        client.attach(std::slice::from_ref(&module))?;
        config.cs2c = true;
        builder = builder.cache(client);
    }
    let dynarec = builder.config(config).build()?;

    let mut exec = ExecContext::default();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([entry]);
    let mut failed = 0usize;
    while let Some(addr) = queue.pop_front() {
        if !seen.insert(addr) || modules.module_of(addr).is_none() {
            continue;
        }
        match dynarec.db_get_block(&mut exec, addr, true, true) {
            Some(block) => queue.extend(block.jump_targets().iter().copied()),
            None => failed += 1,
        }
    }
    info!(
        blocks = dynarec.len(),
        failed,
        max_block = dynarec.max_db_size(),
        "translation done"
    );
    println!("{}", dynarec.stats());
    dynarec.shutdown();
    Ok(())
}

fn serve(listen: &str) -> Result<(), Box<dyn std::error::Error>> {
    let server = CacheServer::bind(listen, MemoryStore::new())?;
    server.serve()?;
    Ok(())
}
