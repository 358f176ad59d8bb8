#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use e2l_block::{ByteDevice, FileByteDevice};
use e2l_fs::{DirCursor, Ext2Fs};
use e2l_types::is_dir;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "e2l", about = "ext2-lite — inspect and read filesystem images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show superblock geometry and mount state.
    Inspect {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Report free space and inode counts.
    Statfs {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List a directory.
    Ls {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Directory path inside the image (default: root).
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file's contents to stdout.
    Cat {
        /// Path to the filesystem image.
        image: PathBuf,
        /// File path inside the image.
        path: String,
    },
    /// Print a symlink's target.
    Readlink {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Symlink path inside the image.
        path: String,
    },
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    blocks_count: u32,
    inodes_count: u32,
    free_blocks: u32,
    free_inodes: u32,
    groups: u32,
    inodes_per_group: u32,
    blocks_per_group: u32,
    inode_size: u16,
    rev_level: u32,
    state_valid: bool,
    state_errors: bool,
    mount_options: String,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Statfs { image, json } => statfs(&image, json),
        Command::Ls { image, path } => ls(&image, &path),
        Command::Cat { image, path } => cat(&image, &path),
        Command::Readlink { image, path } => readlink(&image, &path),
    }
}

fn open_fs(image: &PathBuf) -> Result<Ext2Fs> {
    let dev = FileByteDevice::open(image)
        .with_context(|| format!("open image {}", image.display()))?;
    let boxed: Box<dyn ByteDevice> = Box::new(dev);
    Ext2Fs::mount(boxed, "", true).context("mount image read-only")
}

fn inspect(image: &PathBuf, json: bool) -> Result<()> {
    let fs = open_fs(image)?;
    let sb = fs.superblock();
    let geo = fs.geometry();

    let out = InspectOutput {
        block_size: sb.block_size,
        blocks_count: sb.blocks_count,
        inodes_count: sb.inodes_count,
        free_blocks: sb.free_blocks_count,
        free_inodes: sb.free_inodes_count,
        groups: geo.groups_count,
        inodes_per_group: sb.inodes_per_group,
        blocks_per_group: sb.blocks_per_group,
        inode_size: sb.inode_size,
        rev_level: sb.rev_level,
        state_valid: sb.state & e2l_types::VALID_FS != 0,
        state_errors: sb.state & e2l_types::ERROR_FS != 0,
        mount_options: fs.show_options(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("block size:        {}", out.block_size);
        println!("blocks:            {}", out.blocks_count);
        println!("inodes:            {}", out.inodes_count);
        println!("free blocks:       {}", out.free_blocks);
        println!("free inodes:       {}", out.free_inodes);
        println!("block groups:      {}", out.groups);
        println!("blocks per group:  {}", out.blocks_per_group);
        println!("inodes per group:  {}", out.inodes_per_group);
        println!("inode size:        {}", out.inode_size);
        println!("revision:          {}", out.rev_level);
        println!(
            "state:             {}{}",
            if out.state_valid { "clean" } else { "unclean" },
            if out.state_errors { " (errors)" } else { "" },
        );
    }
    fs.unmount()?;
    Ok(())
}

fn statfs(image: &PathBuf, json: bool) -> Result<()> {
    let fs = open_fs(image)?;
    let stat = fs.statfs()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stat)?);
    } else {
        println!("blocks:      {}", stat.blocks);
        println!("free blocks: {}", stat.bfree);
        println!("files:       {}", stat.files);
        println!("free files:  {}", stat.ffree);
        println!("name limit:  {}", stat.namelen);
        println!("fsid:        {:016x}", stat.fsid);
    }
    fs.unmount()?;
    Ok(())
}

fn ls(image: &PathBuf, path: &str) -> Result<()> {
    let fs = open_fs(image)?;
    let dir = fs.resolve(path)?;

    let mut entries = Vec::new();
    let mut cursor = DirCursor::default();
    fs.readdir(&dir, &mut cursor, &mut |name, ino| {
        entries.push((String::from_utf8_lossy(name).into_owned(), ino));
        true
    })?;

    for (name, ino) in entries {
        let child = fs.iget(ino)?;
        let attr = fs.getattr(&child);
        let marker = if is_dir(attr.mode) { "/" } else { "" };
        println!("{:>8}  {:o}  {:>10}  {}{}", ino.0, attr.mode, attr.size, name, marker);
        fs.iput(child)?;
    }

    fs.iput(dir)?;
    fs.unmount()?;
    Ok(())
}

fn cat(image: &PathBuf, path: &str) -> Result<()> {
    let fs = open_fs(image)?;
    let file = fs.resolve(path)?;
    let size = fs.getattr(&file).size as usize;

    let mut buf = vec![0_u8; size];
    let read = fs.read_at(&file, 0, &mut buf)?;
    std::io::stdout().write_all(&buf[..read])?;

    fs.iput(file)?;
    fs.unmount()?;
    Ok(())
}

fn readlink(image: &PathBuf, path: &str) -> Result<()> {
    let fs = open_fs(image)?;
    let link = fs.resolve(path)?;
    let target = fs.read_symlink(&link)?;
    println!("{}", String::from_utf8_lossy(&target));
    fs.iput(link)?;
    fs.unmount()?;
    Ok(())
}
