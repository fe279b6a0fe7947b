//! Mounts an append-oriented tagged-block filesystem through FUSE.

use appendfs::fs::AppendFs;
use appendfs::fs::record::OVERHEAD_SIZE;
use appendfs::fuse::Bridge;
use appendfs::io::{BlockIo, IoConfig};
use fuser::MountOption;
use std::env;
use std::env::ArgsOs;
use std::fmt;
use std::path::PathBuf;
use std::process::exit;

/// Payload bytes carried by every block of a mounted container.
const DEFAULT_PAYLOAD_SIZE: usize = 1024;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// If true, wipe the container before mounting.
    format: bool,
    /// The container file, or `:memory:`.
    container: Option<PathBuf>,
    /// The directory to mount on.
    mount_point: Option<PathBuf>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("--format") => res.format = true,
            _ if res.container.is_none() => res.container = Some(PathBuf::from(arg)),
            _ if res.mount_point.is_none() => res.mount_point = Some(PathBuf::from(arg)),
            _ => res.help = true,
        }
    }
    res
}

/// Prints command help.
fn print_help() {
    println!("Usage: appendfs [options] <container> <directory>");
    println!();
    println!("Pass \":memory:\" in place of a container path to use RAM instead.");
    println!();
    println!("Options:");
    println!(" -h, --help\tPrints help.");
    println!(" --format\tFormats (wipes) the container before mounting.");
}

/// Writes an error to stderr, then exits with the matching status.
fn error<M: fmt::Display>(msg: M, status: i32) -> ! {
    eprintln!("appendfs: error: {msg}");
    exit(if status != 0 { status } else { 1 });
}

fn main() {
    let mut raw = env::args_os();
    raw.next(); // binary name
    let args = parse_args(raw);

    if args.help {
        print_help();
        exit(1);
    }
    let (Some(container), Some(mount_point)) = (args.container, args.mount_point) else {
        print_help();
        exit(1);
    };

    let config = IoConfig {
        path: container,
        block_size: DEFAULT_PAYLOAD_SIZE + OVERHEAD_SIZE,
        max_blocks: None,
    };
    let io = BlockIo::open(&config)
        .unwrap_or_else(|e| error(format_args!("{}: {e}", config.path.display()), e.errno()));
    let fs = AppendFs::new(io, args.format)
        .unwrap_or_else(|e| error(format_args!("cannot mount container: {e}"), e.errno()));

    let options = [MountOption::FSName("appendfs".to_owned())];
    if let Err(e) = fuser::mount2(Bridge::new(fs), &mount_point, &options) {
        error(
            format_args!("{}: {e}", mount_point.display()),
            e.raw_os_error().unwrap_or(1),
        );
    }
}
