//! The `mktfs` tool creates a TFS filesystem on a device or image file.

use std::env;
use std::fmt;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::process::exit;
use tfs::{BlockDevice, FileDrive, FormatObserver, FormatState, TinyFs};

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// If true, print nothing but errors.
    quiet: bool,
    /// The path to the device file on which the filesystem will be created.
    device_path: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut res: Args = Default::default();
    for arg in env::args_os().skip(1) {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-q" | "--quiet") => res.quiet = true,
            _ => {
                if res.device_path.is_some() {
                    error("only one device may be given");
                }
                res.device_path = Some(PathBuf::from(arg));
            }
        }
    }
    res
}

/// Writes an error to stderr, then exits.
fn error<M: fmt::Display>(msg: M) -> ! {
    eprintln!("mktfs: error: {msg}");
    exit(1);
}

/// Prints the progress of the running format to stdout.
struct Console;

impl FormatObserver for Console {
    fn state(&mut self, state: FormatState) {
        match state {
            FormatState::Start => println!("formating disk, please wait..."),
            FormatState::BitmapStart => println!("writing bitmap-blocks:"),
            FormatState::BitmapDone => println!(),
            FormatState::RootDir => println!("creating root-directory."),
            FormatState::Done => println!("DONE!"),
        }
    }

    fn progress(&mut self, pos: u32, max: u32) {
        print!("  {pos}/{max}\r");
        let _ = io::stdout().flush();
    }
}

fn main() {
    let args = parse_args();
    if args.help {
        println!("usage: mktfs [-h|--help] [-q|--quiet] <device/image file>");
        return;
    }
    let device_path = args.device_path.unwrap_or_else(|| {
        error("specify path to a device");
    });
    let drive = FileDrive::open(&device_path).unwrap_or_else(|e| {
        error(format_args!("{}: {e}", device_path.display()));
    });
    if !args.quiet {
        let info = drive.info();
        println!(
            "{}: {} ({} blocks, serno {})",
            device_path.display(),
            info.model,
            info.blk_count,
            info.serno
        );
    }
    let mut fs = TinyFs::mount(drive).unwrap_or_else(|e| {
        error(format_args!("{}: {e}", device_path.display()));
    });
    let res = if args.quiet {
        fs.format()
    } else {
        fs.format_with(&mut Console)
    };
    res.unwrap_or_else(|e| {
        error(format_args!("failed to create filesystem: {e}"));
    });
    if !args.quiet {
        let used = fs.used_count().unwrap_or_else(|e| {
            error(format_args!("failed to read back filesystem: {e}"));
        });
        println!("{used} blocks in use.");
    }
}
