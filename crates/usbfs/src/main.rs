use std::io::Write as _;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::Level;

use usbfs::fs::OpenMode;
use usbfs::{DriveManager, FsService, MAX_DRIVES};
use usbfs_fat::EntryKind;
use usbfs_scsi::ScsiOptions;
use usbfs_scsi::transport::host::RusbTransport;

#[derive(Parser, Debug)]
#[clap(version, about = "USB mass-storage bridge (fsp-usb)", long_about = None)]
struct Opts {
    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Hot-plug poll interval of the libusb backend, in milliseconds
    #[clap(long, default_value_t = 500)]
    poll_interval_ms: u64,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List mounted drives
    List,
    /// Read a drive's volume label, or set it with --set
    Label {
        id: i32,
        /// New label (empty string clears the label)
        #[clap(long)]
        set: Option<String>,
    },
    /// List a directory on a drive
    Ls {
        id: i32,
        #[clap(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout
    Cat { id: i32, path: String },
    /// Run the bridge until interrupted
    Serve,
}

fn main() -> anyhow::Result<()> {
    let options = Opts::parse();

    if options.verbose {
        env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                let level = record.level();
                if level == Level::Info {
                    writeln!(buf, "{}", record.args())
                } else {
                    writeln!(buf, "{}: {}", record.level(), record.args())
                }
            })
            .init();
    }

    let transport = Arc::new(RusbTransport::with_poll_interval(Duration::from_millis(
        options.poll_interval_ms,
    )));
    let manager = DriveManager::new(transport, ScsiOptions::default());
    manager.start();

    let service = FsService::new(manager.clone());
    let result = run(&service, options.command);

    manager.shutdown();
    result
}

fn run(service: &FsService, command: Command) -> anyhow::Result<()> {
    match command {
        Command::List => {
            let mut ids = [0i32; MAX_DRIVES];
            let count = service.list_mounted_drives(&mut ids) as usize;

            if count == 0 {
                println!("no drives mounted");
                return Ok(());
            }
            for &id in &ids[..count] {
                let fs_type = service.get_drive_fs_type(id)?;
                let label = service.get_drive_label(id)?;
                let identity = service
                    .drive_identity(id)?
                    .map(|(vendor, product)| format!("{vendor} {product}"))
                    .unwrap_or_default();
                println!("{id}: fs-type {fs_type}, label {label:?}, {identity}");
            }
        }
        Command::Label { id, set } => match set {
            Some(label) => {
                service.set_drive_label(id, &label)?;
                println!("label set to {:?}", service.get_drive_label(id)?);
            }
            None => println!("{}", service.get_drive_label(id)?),
        },
        Command::Ls { id, path } => {
            let fs = service.open_drive_filesystem(id)?;
            let dir = fs.open_directory(&path)?;
            for entry in dir.read_entries(usize::MAX)? {
                match entry.kind {
                    EntryKind::Directory => println!("{}/", entry.name),
                    EntryKind::File => println!("{}  {}", entry.name, entry.size),
                }
            }
        }
        Command::Cat { id, path } => {
            let fs = service.open_drive_filesystem(id)?;
            let file = fs.open_file(&path, OpenMode::READ)?;

            let mut stdout = std::io::stdout().lock();
            let mut offset = 0u64;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(offset, &mut buf)?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n])?;
                offset += n as u64;
            }
        }
        Command::Serve => {
            let (tx, rx) = mpsc::channel::<()>();
            ctrlc::set_handler(move || {
                tx.send(()).ok();
            })?;

            log::info!("serving; press ctrl+c to stop");
            rx.recv().ok();
        }
    }

    Ok(())
}
