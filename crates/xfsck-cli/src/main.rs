#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use std::env;
use std::path::Path;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use xfsck_check::check_image_at_path;
use xfsck_error::FsckError;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Diagnostics go to stdout; only tracing output uses stderr.
    if let Err(error) = run() {
        println!("{error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(first) = args.next() else {
        print_usage();
        bail!("an image path is required");
    };

    match first.as_str() {
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        path => {
            if let Some(extra) = args.next() {
                print_usage();
                bail!("unexpected argument: {extra}");
            }
            let path = Path::new(path);
            match check_image_at_path(path) {
                Ok(()) => {
                    debug!(image = %path.display(), "image is consistent");
                    Ok(())
                }
                Err(error) => Err(describe_failure(path, error)),
            }
        }
    }
}

/// A defect message stands on its own; environment errors (unopenable
/// or malformed image) carry the image path.
fn describe_failure(path: &Path, error: FsckError) -> anyhow::Error {
    if error.is_defect() {
        anyhow::Error::new(error)
    } else {
        anyhow::Error::new(error).context(path.display().to_string())
    }
}

fn print_usage() {
    println!("xfsck - consistency checker for xv6 filesystem images\n");
    println!("USAGE:");
    println!("  xfsck <image-path>");
    println!();
    println!("Exits 0 if the image is consistent; exits 1 and prints the");
    println!("first violation found otherwise.");
}
