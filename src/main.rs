mod cli;

use cli::Cli;

use clap::Parser;
use skein_torrent::config::Config;
use skein_torrent::extensions::{Extension, MetadataExtension};
use skein_torrent::metainfo::Metainfo;
use skein_torrent::prelude::*;
use skein_torrent::session::{SessionCommand, TorrentSession};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Cli::parse();
    let metainfo = Metainfo::from_bencode_file(&matches.source).await?;

    let config = Config {
        download_root: matches.download_dir,
        listen_port: matches.port,
        ..Config::default()
    };

    // the session serves the descriptor it was loaded with to peers that
    // only know the content identifier.
    let info_hash = metainfo.file_info.info_hash()?;
    let encoded_info = serde_bencode::to_bytes(&metainfo.file_info).map_err(anyhow::Error::msg)?;
    let extensions: Vec<Box<dyn Extension>> =
        vec![Box::new(MetadataExtension::serving(info_hash, encoded_info))];

    let mut session = TorrentSession::create(&metainfo, config, extensions).await?;
    let handle = session.handle();

    for addr in matches.peers {
        handle
            .commands_tx
            .send(SessionCommand::AddPeer(addr))
            .await?;
    }

    let shutdown = handle.shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, shutting down");
        shutdown.cancel();
    });

    session.run().await
}
