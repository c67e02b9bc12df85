//! Print the blocks and delete set of an encoded update.
//!
//! Usage: dump-update <file> [--v2]
//!
//! Set RUST_LOG=debug to see decoder diagnostics.

use std::process::ExitCode;

use stitch::block::Block;
use stitch::update::Update;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn describe(block: &Block) -> String {
    match block {
        Block::Item(item) => {
            let mut line = format!("item {} len {}", item.id, item.len);
            if let Some(origin) = item.origin {
                line.push_str(&format!(" origin {}", origin));
            }
            if let Some(right) = item.right_origin {
                line.push_str(&format!(" right {}", right));
            }
            if let Some(key) = &item.parent_sub {
                line.push_str(&format!(" key {:?}", key));
            }
            line.push_str(&format!(" parent {:?} content {:?}", item.parent, item.content));
            line
        }
        Block::Gc(range) => format!("gc {} len {}", range.id, range.len),
        Block::Skip(range) => format!("skip {} len {}", range.id, range.len),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(true)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(path) = args.iter().find(|a| !a.starts_with("--")) else {
        eprintln!("usage: dump-update <file> [--v2]");
        return ExitCode::FAILURE;
    };
    let v2 = args.iter().any(|a| a == "--v2");

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(path = %path, error = %e, "failed to read update");
            return ExitCode::FAILURE;
        }
    };
    let decoded = if v2 {
        Update::decode_v2(&bytes)
    } else {
        Update::decode_v1(&bytes)
    };
    let update = match decoded {
        Ok(update) => update,
        Err(e) => {
            error!(path = %path, error = %e, "failed to decode update");
            return ExitCode::FAILURE;
        }
    };
    info!(bytes = bytes.len(), v2, "decoded update");

    let mut clients: Vec<u64> = update.clients().copied().collect();
    clients.sort_unstable_by(|a, b| b.cmp(a));
    for client in clients {
        println!("client {}", client);
        for block in update.blocks(&client) {
            println!("  {}", describe(block));
        }
    }
    println!("delete set");
    for client in update.delete_set().clients_desc() {
        let ranges: Vec<String> = update
            .delete_set()
            .ranges(&client)
            .iter()
            .map(|r| format!("[{}, {})", r.start, r.end))
            .collect();
        println!("  client {}: {}", client, ranges.join(" "));
    }
    return ExitCode::SUCCESS;
}
