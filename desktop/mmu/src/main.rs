/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{io, mem, path::PathBuf, process, ptr::null_mut, thread};

use clap::{error::ErrorKind, CommandFactory, Parser};
use env_logger::{Builder, Env};
use log::{error, info};
use mempager::{Mmu, MmuConfig, MmuError};

#[derive(Parser)]
#[command(name = "mmu")]
#[command(about = "Memory manager that serves demand paging to uvm clients")]
struct Args {
    /// Number of frames of physical memory (1 to 256)
    frames: usize,

    /// Number of blocks of the swap disk (2 to 1024)
    blocks: usize,

    /// Unix socket clients connect to
    #[arg(long, env = "MEMPAGER_SOCKET", default_value = "/tmp/mempager.sock")]
    socket: PathBuf,

    /// Directory of the physical memory image (default: system temp directory)
    #[arg(long)]
    pmem_dir: Option<PathBuf>,
}

/// Blocks SIGINT for this and all threads spawned later, so only `sigwait` receives it.
fn block_sigint() -> io::Result<libc::sigset_t> {
    let mut set: libc::sigset_t = unsafe { mem::zeroed() };
    let res = unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, null_mut())
    };
    if res != 0 {
        return Err(io::Error::from_raw_os_error(res));
    }
    Ok(set)
}

fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_module_path(false)
        .init();

    let args = Args::parse();
    let mut config = MmuConfig::new(args.frames, args.blocks);
    config.socket_path = args.socket;
    if let Some(pmem_dir) = args.pmem_dir {
        config.pmem_dir = pmem_dir;
    }

    let set = match block_sigint() {
        Ok(set) => set,
        Err(err) => {
            error!("could not block SIGINT: {}", err);
            process::exit(1);
        }
    };

    let mmu = match Mmu::bind(config) {
        Ok(mmu) => mmu,
        Err(MmuError::Config(err)) => Args::command()
            .error(ErrorKind::ValueValidation, err)
            .exit(),
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };

    let handle = mmu.shutdown_handle();
    thread::spawn(move || {
        let mut signal = 0;
        if unsafe { libc::sigwait(&set, &mut signal) } == 0 {
            info!("received signal {}", signal);
        }
        handle.shutdown();
    });

    if let Err(err) = mmu.run() {
        error!("{}", err);
        process::exit(1);
    }
}
