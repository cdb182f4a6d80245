use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use imagr_core::backend::ScanOptions;
use imagr_core::catalog::DeviceCatalog;
use imagr_core::device::{DeviceEntry, human_size};
use imagr_core::read::ReadOptions;
use imagr_core::write::WriteOptions;
use imagr_core::{platform, read, write};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "imagr")]
#[command(about = "A safe, interactive disk imaging tool", version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a device interactively
    Write {
        /// Image file to write (.img, .gz, .bz2, .xz or single-entry .zip)
        #[arg(required = true)]
        image: PathBuf,

        /// Skip the read-back verification pass
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// List every disk, the system disk included
        #[arg(long = "all-disks")]
        all_disks: bool,

        /// Also offer serial ports as targets
        #[arg(short = 's', long)]
        serial: bool,

        /// Serial line speed
        #[arg(long, default_value_t = 115_200)]
        baud: u32,

        /// Skip the bootloader handshake on serial targets
        #[arg(long = "no-handshake")]
        no_handshake: bool,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
    /// Read a device back into an image file interactively
    Read {
        /// Output image file
        #[arg(required = true)]
        image: PathBuf,

        /// Compress the output with bzip2
        #[arg(short = 'c', long)]
        compress: bool,

        /// List every disk, the system disk included
        #[arg(long = "all-disks")]
        all_disks: bool,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
    /// List available target devices
    List {
        /// List every disk, the system disk included
        #[arg(long = "all-disks")]
        all_disks: bool,

        /// Also list serial ports
        #[arg(short = 's', long)]
        serial: bool,
    },
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as
/// `^C`. Disabling it gives a cleaner exit when the user cancels, since
/// the `ctrlc` handler prints its own message. The original terminal
/// state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let fd = stdout().as_raw_fd();
            let original = match Termios::from_fd(fd) {
                Ok(t) => t,
                Err(_) => {
                    return Self {
                        original_termios: None,
                    };
                }
            };
            let mut quiet = original;
            quiet.c_lflag &= !ECHOCTL;
            Self {
                original_termios: tcsetattr(fd, TCSANOW, &quiet).is_ok().then_some(original),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original).ok();
        }
    }
}

/// Presents an interactive menu and returns the chosen catalog index.
fn select_target(entries: &[DeviceEntry], prompt: &str) -> Result<usize> {
    if entries.is_empty() {
        return Err(anyhow!("No candidate devices found."));
    }

    let items: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;
    Ok(selection)
}

fn confirm_operation(prompt: &str) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

fn percent_bar(prefix: &'static str, color: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_prefix(prefix);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{pos:>3}}% {{msg}}"
            ))
            .unwrap()
            .progress_chars("■ "),
    );
    bar
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "imagr=debug,imagr_core=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut backend = platform::native_backend();
    let mut catalog = DeviceCatalog::new();

    match cli.command {
        Commands::Write {
            image,
            no_verify,
            all_disks,
            serial,
            baud,
            no_handshake,
            yes,
        } => {
            let scan = ScanOptions {
                include_serial: serial,
                all_disks,
            };
            catalog.refresh(&mut backend, &scan)?;
            let target = select_target(catalog.entries(), "Select the target device to WRITE to")?;
            let entry = catalog.get(target).expect("selection is in range");

            println!(
                "{} This will erase all data on '{}'.",
                style("WARNING:").red().bold(),
                entry.label,
            );
            println!("  Device: {}", style(entry.path.display()).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            println!();

            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Write operation cancelled.");
                return Ok(());
            }
            println!();

            let bar = percent_bar("Writing", "green");
            let opts = WriteOptions {
                verify: !no_verify,
                allow_system_disk: all_disks,
                baud,
                handshake: !no_handshake,
                ..WriteOptions::default()
            };

            let result = write::run(
                &image,
                &mut backend,
                &catalog,
                target,
                &opts,
                running,
                |percent, message| {
                    bar.set_position(percent as u64);
                    bar.set_message(message.to_string());
                },
            );

            match result {
                Ok(()) => {
                    bar.finish();
                    println!(
                        "\n✨ Successfully flashed {} with {}.",
                        style(entry.path.display()).cyan(),
                        style(image.display()).cyan()
                    );
                }
                Err(e) => {
                    bar.finish_and_clear();
                    return Err(e.into());
                }
            }
        }
        Commands::Read {
            image,
            compress,
            all_disks,
            yes,
        } => {
            let scan = ScanOptions {
                include_serial: false,
                all_disks,
            };
            catalog.refresh(&mut backend, &scan)?;
            let target = select_target(catalog.entries(), "Select the source device to READ from")?;
            let entry = catalog.get(target).expect("selection is in range");

            println!(
                "This will read {} from '{}'.",
                human_size(entry.capacity),
                entry.label
            );
            println!("  Device: {}", style(entry.path.display()).cyan());
            println!("  Output: {}", style(image.display()).cyan());
            println!();

            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Read operation cancelled.");
                return Ok(());
            }
            println!();

            let bar = ProgressBar::new(0);
            let on_start = |len| {
                bar.set_length(len);
                bar.set_prefix("Reading");
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template(
                            "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                        )
                        .unwrap()
                        .progress_chars("■ "),
                );
            };
            let on_progress = |bytes| bar.set_position(bytes);

            let opts = ReadOptions {
                compress,
                ..ReadOptions::default()
            };
            let result = read::run(
                &mut backend,
                &catalog,
                target,
                &image,
                &opts,
                running,
                on_start,
                on_progress,
            );

            match result {
                Ok(()) => {
                    bar.finish_with_message("Read complete.");
                    println!(
                        "\n✨ Successfully read {} to {}.",
                        style(entry.path.display()).cyan(),
                        style(image.display()).cyan()
                    );
                }
                Err(e) => {
                    bar.finish_and_clear();
                    return Err(e.into());
                }
            }
        }
        Commands::List { all_disks, serial } => {
            let scan = ScanOptions {
                include_serial: serial,
                all_disks,
            };
            catalog.refresh(&mut backend, &scan)?;
            if catalog.is_empty() {
                println!("No candidate devices found.");
                return Ok(());
            }

            println!("Found {} candidate devices:", catalog.len());
            println!("\n  {:<4} {:<16} {}", "#", "DEVICE", "LABEL");
            println!("  {:-<4} {:-<16} {:-<40}", "", "", "");
            for (i, entry) in catalog.entries().iter().enumerate() {
                let label = if entry.system {
                    format!("{} {}", entry.label, style("(system disk)").red())
                } else {
                    entry.label.clone()
                };
                println!("  {:<4} {:<16} {}", i, entry.path.display(), label);
            }
        }
    }

    Ok(())
}
