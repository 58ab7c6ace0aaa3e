//! Ambient stack around the edge-stream subsystem: config loading, address
//! policy compilation, logging setup. The actual circuit layer, DNS worker
//! pool, rendezvous client, and I/O reactor are external collaborators (see
//! `edge::collab`) owned by whatever process embeds this crate — wiring
//! them to [`edge::entry::EntryOrchestrator`] / [`edge::exit::ExitOrchestrator`]
//! happens there, not here.

pub mod config;
pub mod policy;

use config::Config;
use policy::{compile_redirect_table, AddressPolicy};

/// In order to let integration tests directly use this crate and exercise
/// config loading without going through the binary, a function is exposed
/// to replace `main` one layer down.
pub fn startup(config: Config) -> anyhow::Result<()> {
    let socks_policy = AddressPolicy::compile(&config.edge.socks_policy)?;
    let exit_policy = AddressPolicy::compile(&config.edge.exit_policy)?;
    let redirects = compile_redirect_table(&config.edge.redirect_table)?;

    log::info!(
        "edge-stream subsystem ready: {} SOCKS interface(s), new-circuit-period={}s, {} redirect rule(s), hibernating={}",
        config.edge.listen.len(),
        config.edge.new_circuit_period,
        config.edge.redirect_table.len(),
        config.edge.hibernating,
    );

    // `socks_policy` and `exit_policy` are handed to the reactor that owns
    // the actual sockets, circuit layer, DNS worker pool, and rendezvous
    // client; this crate's job ends at compiling config into the types
    // those collaborators expect.
    let _ = (socks_policy, exit_policy, redirects);

    Ok(())
}
