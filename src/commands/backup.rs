use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::peer::{Peer, PeerConfig};
use crate::signal::{Mailbox, MailboxConfig};
use crate::transfer::{Transfer, TransferConfig};
use crate::BoxError;

pub struct BackupArgs {
    pub session_id: String,
    pub stun: Vec<String>,
    pub api_key: String,
    pub zip_dir: bool,
    pub source_entry: Option<PathBuf>,
    pub output_filename: Option<String>,
    pub destination_dir: Option<PathBuf>,
    pub versions: u16,
    pub passfile: Option<PathBuf>,
}

/// Runs one peer of a backup session to completion: dial, negotiate, run
/// the single transfer, tear everything down.
pub async fn run(args: BackupArgs) -> Result<(), BoxError> {
    let instance_id = Uuid::new_v4().to_string();

    info!(
        "starting backup session {}, instance {}",
        args.session_id, instance_id
    );

    // A bad password file must fail before any networking happens.
    let (password1, password2) = match &args.passfile {
        Some(path) => super::password_store(path.clone())?.load()?,
        None => (String::new(), String::new()),
    };

    let mailbox = Arc::new(Mailbox::new(MailboxConfig {
        api_key: args.api_key,
        session_id: args.session_id,
        instance_id,
    })?);

    let transfer = Transfer::new(TransferConfig {
        zip_dir: args.zip_dir,
        source_entry: args.source_entry,
        destination_dir: args.destination_dir,
        output_filename: args.output_filename,
        versions: args.versions,
        password1,
        password2,
    })?;

    let (peer, established) = Peer::new(PeerConfig { stun: args.stun }, Arc::clone(&mailbox)).await?;
    let peer = Arc::new(peer);

    let root = CancellationToken::new();

    {
        let root = root.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                debug!("ctrl-c listener failed: {}", e);
                return;
            }
            root.cancel();
        });
    }

    // The transfer waits for the data channel and runs exactly once.
    let mut transfer_task = tokio::spawn(async move {
        match established.await {
            Ok(stream) => transfer.run(stream).await,
            Err(_) => debug!("peer closed before a data channel was established"),
        }
    });

    peer.dial().await?;

    let (events_tx, events_rx) = mpsc::channel(64);

    let pump = {
        let peer = Arc::clone(&peer);
        tokio::spawn(async move { peer.serve(events_rx).await })
    };

    let listener = {
        let mailbox = Arc::clone(&mailbox);
        let cancel = root.clone();
        tokio::spawn(async move { mailbox.listen(cancel, events_tx).await })
    };

    let peer_done = peer.done();

    tokio::select! {
        _ = root.cancelled() => debug!("cancelled"),
        _ = peer_done.cancelled() => debug!("peer connection ended"),
        _ = &mut transfer_task => debug!("transfer finished"),
    }

    peer.close().await;
    root.cancel();

    // The listener performs mailbox cleanup on its way out; dropping its
    // event sender also ends the pump.
    let _ = listener.await;
    let _ = pump.await;

    info!("ending backup session");

    Ok(())
}
