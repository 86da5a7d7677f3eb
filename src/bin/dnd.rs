//! DnD CLI binary.
//!
//! Drives the host side of the drag-and-drop protocol against an
//! in-process loopback guest.
//!
//! # Commands
//!
//! - `send` - Drag host files into the guest
//! - `send-text` - Drag a text snippet into the guest
//! - `receive` - Drag guest files (or text) onto the host

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dnd::{
    protocol::{ActionSet, DndAction, FormatList, MIME_TEXT_PLAIN, MIME_URI_LIST},
    transfer::encode_uri_list,
    Config, DndManager, GuestOffer, GuestOptions, LoopbackGuest, ProgressOutcome, Source, Target,
    VERSION,
};

#[derive(Parser)]
#[command(name = "dnd")]
#[command(version = VERSION)]
#[command(about = "Guest/host drag-and-drop transfers", long_about = None)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Protocol version the loopback guest speaks (1-3)
    #[arg(long, global = true, default_value = "3")]
    protocol_version: u32,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drag host files and directories into the guest
    Send {
        /// Files or directories to drag
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Directory the guest drops into
        #[arg(short, long)]
        dest: Option<PathBuf>,
    },

    /// Drag text into the guest
    SendText {
        /// Text to drag
        text: String,
    },

    /// Drag guest data onto the host
    Receive {
        /// Guest files or directories to offer
        #[arg(long, conflicts_with = "text")]
        from: Vec<PathBuf>,

        /// Guest text to offer
        #[arg(long)]
        text: Option<String>,

        /// Format the host asks for
        #[arg(short, long)]
        format: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config)?;
    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Send { paths, dest } => {
            runtime.block_on(cmd_send(config, cli.protocol_version, paths, dest))
        },
        Commands::SendText { text } => {
            runtime.block_on(cmd_send_text(config, cli.protocol_version, text))
        },
        Commands::Receive { from, text, format } => {
            runtime.block_on(cmd_receive(config, cli.protocol_version, from, text, format))
        },
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let base = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let config = base.merge(Config::from_env());
    config.validate()?;
    Ok(config)
}

fn connect(
    config: Config,
    options: GuestOptions,
) -> anyhow::Result<(Arc<DndManager>, Arc<LoopbackGuest>)> {
    let guest = LoopbackGuest::new(options)?;
    let manager = DndManager::new(config, guest.clone());
    guest.attach(&manager)?;
    tracing::debug!(
        version = manager.state().protocol_version(),
        "loopback guest connected"
    );
    Ok((manager, guest))
}

fn copy_actions() -> ActionSet {
    [DndAction::Copy, DndAction::Move].into_iter().collect()
}

async fn drag_to_guest(target: &Target, formats: &FormatList, data: Vec<u8>) -> anyhow::Result<()> {
    let allowed = copy_actions();
    let action = target
        .enter(0, 0, 0, DndAction::Copy, allowed, formats)
        .await?;
    if action == DndAction::Ignore {
        target.leave()?;
        anyhow::bail!("guest refused the drag");
    }

    let dropped = target.drop(0, 0, 0, action, allowed, formats).await?;
    tracing::info!(format = %dropped.format, action = %dropped.action, "guest accepted drop");

    let progress = target.send_data(0, &dropped.format, data)?;
    match progress.wait().await {
        ProgressOutcome::Success => Ok(()),
        ProgressOutcome::Cancelled => anyhow::bail!("transfer cancelled"),
        ProgressOutcome::Failed { rc, message } => {
            anyhow::bail!("transfer failed ({rc}): {message}")
        },
    }
}

async fn cmd_send(
    config: Config,
    protocol_version: u32,
    paths: Vec<PathBuf>,
    dest: Option<PathBuf>,
) -> anyhow::Result<()> {
    let dest = dest.unwrap_or_else(|| config.transfer.staging_dir.clone());
    let options = GuestOptions::default()
        .with_protocol_version(protocol_version)
        .with_block_size(config.transfer.block_size)
        .with_drop_dir(dest);
    let (manager, guest) = connect(config, options)?;
    let target = Target::new(&manager);

    let mut absolute = Vec::with_capacity(paths.len());
    for path in &paths {
        let path = path.canonicalize()?;
        absolute.push(path.to_string_lossy().into_owned());
    }
    let uri_list = encode_uri_list(absolute.iter().map(String::as_str));
    let formats: FormatList = [MIME_URI_LIST].into_iter().collect();

    drag_to_guest(&target, &formats, uri_list.into_bytes()).await?;

    for path in guest.received_paths() {
        println!("{}", path.display());
    }
    Ok(())
}

async fn cmd_send_text(config: Config, protocol_version: u32, text: String) -> anyhow::Result<()> {
    let options = GuestOptions::default()
        .with_protocol_version(protocol_version)
        .with_block_size(config.transfer.block_size);
    let (manager, guest) = connect(config, options)?;
    let target = Target::new(&manager);
    let formats: FormatList = [MIME_TEXT_PLAIN].into_iter().collect();

    drag_to_guest(&target, &formats, text.into_bytes()).await?;

    println!("{}", String::from_utf8_lossy(&guest.received_data()));
    Ok(())
}

async fn cmd_receive(
    config: Config,
    protocol_version: u32,
    from: Vec<PathBuf>,
    text: Option<String>,
    format: Option<String>,
) -> anyhow::Result<()> {
    let offer = match text {
        Some(text) => GuestOffer::text(&text),
        None if !from.is_empty() => GuestOffer::files(from),
        None => anyhow::bail!("nothing to offer: pass --from or --text"),
    };
    let format = format.unwrap_or_else(|| {
        offer
            .formats
            .first()
            .unwrap_or(MIME_TEXT_PLAIN)
            .to_string()
    });

    let options = GuestOptions::default()
        .with_protocol_version(protocol_version)
        .with_block_size(config.transfer.block_size);
    let (manager, guest) = connect(config, options)?;
    guest.set_offer(Some(offer));

    let source = Source::new(&manager);
    let pending = source.drag_is_pending(0).await?;
    if !pending.is_pending() {
        anyhow::bail!("guest has no drag pending");
    }
    tracing::info!(formats = %pending.formats, "guest drag pending");

    let progress = source.drop(&format, pending.default_action)?;
    match progress.wait().await {
        ProgressOutcome::Success => {},
        ProgressOutcome::Cancelled => anyhow::bail!("transfer cancelled"),
        ProgressOutcome::Failed { rc, message } => {
            anyhow::bail!("transfer failed ({rc}): {message}")
        },
    }

    println!("{}", String::from_utf8_lossy(&source.receive_data()));
    Ok(())
}
