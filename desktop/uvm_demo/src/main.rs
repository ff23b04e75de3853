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

use std::{io::Write, path::PathBuf, process, ptr};

use clap::Parser;
use env_logger::{Builder, Env};
use log::{error, info};
use mempager::{page_size, Uvm, UvmConfig, UvmError, UVM_BASE_ADDR};

#[derive(Parser)]
#[command(name = "uvm_demo")]
#[command(about = "Client that drives a running mmu into swapping")]
struct Args {
    /// Pages to allocate
    #[arg(long, default_value_t = 5)]
    pages: usize,

    /// Rounds of writing and printing every page
    #[arg(long, default_value_t = 4)]
    loops: usize,

    /// Unix socket of the mmu
    #[arg(long, env = "MEMPAGER_SOCKET", default_value = "/tmp/mempager.sock")]
    socket: PathBuf,
}

fn run(args: Args) -> Result<(), UvmError> {
    let uvm = Uvm::connect(UvmConfig {
        socket_path: args.socket,
    })?;

    let mut pages = vec![];
    for _ in 0..args.pages {
        match uvm.extend() {
            Ok(page) => pages.push(page.as_ptr()),
            Err(UvmError::NoSpace) => break,
            Err(err) => return Err(err),
        }
    }
    info!("extended {} of {} pages", pages.len(), args.pages);

    // every other page is written, the rest is only read
    let mut out = std::io::stdout().lock();
    for (i, page) in pages.iter().enumerate() {
        unsafe {
            if i % 2 == 1 {
                ptr::write_volatile(*page, b'z');
            }
            let _ = writeln!(out, "{}", ptr::read_volatile(*page) as char);
        }
    }
    for page in &pages {
        let _ = writeln!(out, "{}", unsafe { ptr::read_volatile(*page) } as char);
    }
    drop(out);

    let pid = process::id().to_string();
    for _ in 0..args.loops {
        for i in 0..args.pages {
            let addr = (UVM_BASE_ADDR + i * page_size() + 10) as *mut u8;
            match pages.get(i) {
                Some(_) => {
                    for (offset, byte) in pid.bytes().enumerate() {
                        unsafe { ptr::write_volatile(addr.add(offset), byte) };
                    }
                    uvm.read_region(addr, pid.len())?;
                }
                None => match uvm.read_region(addr, 6) {
                    Err(UvmError::InvalidRegion) => {}
                    Ok(()) => error!("printing unallocated page {} succeeded", i),
                    Err(err) => return Err(err),
                },
            }
        }
    }

    uvm.exit()
}

fn main() {
    Builder::from_env(Env::default())
        .format_module_path(false)
        .init();

    if let Err(err) = run(Args::parse()) {
        error!("{}", err);
        process::exit(1);
    }
}
