//! SteganoChat command line.
//!
//! `compose` runs the full write pipeline: plan capacity over the cover
//! images, split the plaintext, encrypt each chunk, embed. `read` is the
//! inverse: extract, decrypt, reassemble. The remaining commands manage
//! pairings: `init` creates a contacts store, `invite`/`accept` exchange
//! an invitation blob out-of-band.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::ImageFormat;
use log::debug;

use steganochat::crypto::ratchet::{Ratchet, ENVELOPE_OVERHEAD};
use steganochat::distribution::{self, CHUNK_HEADER_LEN};
use steganochat::stego::StegoEngine;
use steganochat::storage::Contacts;
use steganochat::UserId;

/// Fixed overhead of one embedded piece above its logical plaintext:
/// the chunk envelope plus the encryption envelope.
const RESERVED_SIZE: usize = ENVELOPE_OVERHEAD + CHUNK_HEADER_LEN;

#[derive(Parser)]
#[command(name = "steganochat", version, about = "Covert messaging through cover images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the version and platform
    Version,

    /// Create an empty contacts store
    Init {
        #[arg(long, default_value = "./contacts.db")]
        contacts: PathBuf,
        /// Passphrase protecting the contacts store
        #[arg(long)]
        key: String,
    },

    /// Invite a peer: writes an invitation blob to share out-of-band
    Invite {
        #[arg(long, default_value = "./contacts.db")]
        contacts: PathBuf,
        #[arg(long)]
        key: String,
        /// Display name for the new peer
        #[arg(long)]
        name: String,
        /// Passphrase agreed with the peer, protecting the blob itself
        #[arg(long)]
        invite_key: String,
        /// Where to write the invitation blob
        #[arg(long)]
        output: PathBuf,
    },

    /// Accept an invitation blob received out-of-band
    Accept {
        #[arg(long, default_value = "./contacts.db")]
        contacts: PathBuf,
        #[arg(long)]
        key: String,
        /// Display name for the inviting peer
        #[arg(long)]
        name: String,
        /// Passphrase agreed with the peer
        #[arg(long)]
        invite_key: String,
        /// Path of the invitation blob
        #[arg(long)]
        input: PathBuf,
    },

    /// Compose a message into cover images
    Compose {
        #[arg(long, default_value = "./contacts.db")]
        contacts: PathBuf,
        #[arg(long)]
        key: String,
        /// Cover images to embed into
        #[arg(long, num_args = 1.., required = true)]
        images: Vec<PathBuf>,
        /// Message file; stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
        /// Recipient stable id, hex
        #[arg(long, conflicts_with = "user_name")]
        user_id: Option<String>,
        /// Recipient name
        #[arg(long)]
        user_name: Option<String>,
        #[arg(long, default_value = "./embedded")]
        output_dir: PathBuf,
        /// Output format; must be lossless
        #[arg(long, default_value = "png")]
        image_format: String,
    },

    /// Extract and decrypt a message from carrier images
    Read {
        #[arg(long, default_value = "./contacts.db")]
        contacts: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long, num_args = 1.., required = true)]
        images: Vec<PathBuf>,
        /// Output file; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli.command) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Version => {
            println!(
                "SteganoChat CLI, version {}, {} {}",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            );
            Ok(())
        }
        Command::Init { contacts, key } => {
            Contacts::create(&contacts, &key)?;
            println!("created contacts store at {}", contacts.display());
            Ok(())
        }
        Command::Invite {
            contacts,
            key,
            name,
            invite_key,
            output,
        } => {
            let mut ratchet = Ratchet::open(&contacts, &key)?;
            let (blob, user) = ratchet.invite(&name, &invite_key)?;
            fs::write(&output, &blob)
                .with_context(|| format!("writing {}", output.display()))?;
            ratchet.close()?;
            println!("invited {} with id {}", user.name, user.id);
            Ok(())
        }
        Command::Accept {
            contacts,
            key,
            name,
            invite_key,
            input,
        } => {
            let blob = fs::read(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let mut ratchet = Ratchet::open(&contacts, &key)?;
            let user = ratchet.receive_invitation(&blob, &name, &invite_key)?;
            ratchet.close()?;
            println!("accepted invitation from {} with id {}", user.name, user.id);
            Ok(())
        }
        Command::Compose {
            contacts,
            key,
            images,
            file,
            user_id,
            user_name,
            output_dir,
            image_format,
        } => compose(
            contacts,
            &key,
            &images,
            file,
            user_id,
            user_name,
            &output_dir,
            &image_format,
        ),
        Command::Read {
            contacts,
            key,
            images,
            output,
        } => read(contacts, &key, &images, output),
    }
}

fn parse_format(name: &str) -> Result<ImageFormat> {
    match name.to_ascii_lowercase().as_str() {
        "png" => Ok(ImageFormat::Png),
        "bmp" => Ok(ImageFormat::Bmp),
        other => bail!("unsupported or lossy image format: {other}"),
    }
}

fn read_message(file: Option<PathBuf>) -> Result<Vec<u8>> {
    let content = match file {
        Some(path) => {
            fs::read(&path).with_context(|| format!("reading {}", path.display()))?
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };
    if content.is_empty() {
        bail!("no input provided");
    }
    Ok(content)
}

#[allow(clippy::too_many_arguments)]
fn compose(
    contacts: PathBuf,
    key: &str,
    images: &[PathBuf],
    file: Option<PathBuf>,
    user_id: Option<String>,
    user_name: Option<String>,
    output_dir: &Path,
    image_format: &str,
) -> Result<()> {
    let content = read_message(file)?;
    let format = parse_format(image_format)?;

    let ratchet = Ratchet::open(&contacts, key)?;
    let recipient: UserId = match (user_id, user_name) {
        (Some(id), _) => id.parse().context("invalid user id")?,
        (None, Some(name)) => {
            ratchet
                .contacts()
                .find_by_name(&name)
                .with_context(|| format!("no user named {name}"))?
                .id
        }
        (None, None) => bail!("--user-id or --user-name must be specified"),
    };

    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    // Any failure from here on drops the engine (releasing the images)
    // and the store before the error propagates.
    let mut engine = StegoEngine::new(RESERVED_SIZE);
    let result = compose_inner(&ratchet, &mut engine, &content, recipient, images, output_dir, format);
    engine.clear();
    if result.is_ok() {
        ratchet.close()?;
    }
    result
}

fn compose_inner(
    ratchet: &Ratchet,
    engine: &mut StegoEngine,
    content: &[u8],
    recipient: UserId,
    images: &[PathBuf],
    output_dir: &Path,
    format: ImageFormat,
) -> Result<()> {
    for src in images {
        let name = src
            .file_name()
            .with_context(|| format!("{} has no file name", src.display()))?;
        engine
            .add_image(src, output_dir.join(name))
            .with_context(|| format!("opening {}", src.display()))?;
    }

    let lengths = engine.precompute(content.len())?.lengths();
    debug!("capacity plan: {lengths:?}");

    let chunks = distribution::split(content, &lengths)?;
    let mut pieces = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        pieces.push(ratchet.send(chunk, recipient)?);
    }

    engine.embed(&pieces, format)?;
    println!("embedded {} bytes across {} images", content.len(), pieces.len());
    Ok(())
}

fn read(
    contacts: PathBuf,
    key: &str,
    images: &[PathBuf],
    output: Option<PathBuf>,
) -> Result<()> {
    let mut ratchet = Ratchet::open(&contacts, key)?;

    let mut chunks = Vec::with_capacity(images.len());
    for src in images {
        let piece = StegoEngine::extract(src, RESERVED_SIZE)
            .with_context(|| format!("extracting from {}", src.display()))?;
        let (chunk, user) = ratchet.receive(&piece)?;
        debug!("chunk of {} bytes from {}", chunk.len(), user.name);
        chunks.push(chunk);
    }

    let message = distribution::merge(&chunks)?;
    ratchet.close()?;

    match output {
        Some(path) => fs::write(&path, &message)
            .with_context(|| format!("writing {}", path.display()))?,
        None => std::io::stdout().write_all(&message)?,
    }
    Ok(())
}
