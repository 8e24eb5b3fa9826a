use {
    clap::Parser,
    std::path::PathBuf,
    tnfs::{proto::TNFSD_PORT, srv::Server},
};

#[derive(Debug, clap::Parser)]
#[command(version, about = "Serve a directory tree to retro systems over TNFS")]
struct Cli {
    /// Directory to export
    root: PathBuf,

    /// UDP port to listen on
    #[arg(short, long, default_value_t = TNFSD_PORT)]
    port: u16,

    /// Enable verbose diagnostics
    #[arg(short, long)]
    verbose: bool,
}

async fn tnfsd_main(Cli { root, port, verbose: _ }: Cli) -> tnfs::Result<i32> {
    let mut server = Server::bind(&root, port).await?;

    println!("[*] Exporting: {}", root.display());
    println!("[*] Ready to accept clients on udp port {}", server.local_addr()?.port());
    server.run().await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let exit_code = tnfsd_main(cli).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        1
    });

    std::process::exit(exit_code);
}
