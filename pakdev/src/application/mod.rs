pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Create(args) => handlers::handle_create(*args),
        Commands::Extract {
            archive,
            dest,
            filter,
            use_mount_point,
            response_file,
            order_file,
            keys,
        } => handlers::handle_extract(
            archive,
            dest,
            filter,
            use_mount_point,
            response_file,
            order_file,
            keys,
        ),
        Commands::List {
            archive,
            size_filter,
            include_deleted,
            csv,
            use_mount_point,
            keys,
        } => handlers::handle_list(
            archive,
            size_filter,
            include_deleted,
            csv,
            use_mount_point,
            keys,
        ),
        Commands::Diff {
            first,
            second,
            keys,
        } => handlers::handle_diff(first, second, keys),
        Commands::Repack {
            archive,
            output,
            threads,
            keys,
        } => handlers::handle_repack(archive, output, threads, keys),
        Commands::Audit {
            input,
            only_deleted,
            csv,
            order,
            sort_by_ordering,
            keys,
        } => handlers::handle_audit(input, only_deleted, csv, order, sort_by_ordering, keys),
        Commands::Verify { archive, keys } => handlers::handle_verify(archive, keys),
    }
}
