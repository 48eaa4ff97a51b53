mod config;

use anyhow::{ensure, Context, Result};
use anyscreen_bridge::{
    Bridge, DeviceFile, SignalChannel, Transfer, TransferTicket, TransferWorker,
};
use anyscreen_proto::RequestType;
use async_channel::Receiver;
use clap::Parser;
use config::CliConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{
    fs::{File, OpenOptions},
    io,
    net::SocketAddr,
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{signal, sync::watch};
use tracing::{debug, info, trace, warn};
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "anyscreen-cli", version)]
#[command(about = "Serve the anyscreen request bridge from a disk image", long_about = None)]
struct Args {
    /// Image file the daemon serves block requests from. Created if missing.
    #[arg(long, value_name = "PATH")]
    image: PathBuf,
    /// JSON file with bridge sizing and daemon boundaries.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override the preload batch size, in blocks.
    #[arg(long, value_name = "BLOCKS")]
    batch_size: Option<usize>,
    /// Run a loopback host that writes and reads back this many blocks, then exit.
    #[arg(long, value_name = "BLOCKS")]
    loopback: Option<u64>,
    /// Transfers the loopback host may have posted to the worker at once.
    #[arg(long, default_value_t = 16)]
    worker_capacity: usize,
    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR")]
    metrics_listen: Option<SocketAddr>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = match args.config.as_ref() {
        Some(path) => {
            info!(path = ?path, "config file configured");
            CliConfig::load(path)?
        }
        None => CliConfig::default(),
    };
    if let Some(blocks) = args.batch_size {
        config.daemon.batch_size = Some(blocks);
        config.validate()?;
    }

    if let Some(addr) = args.metrics_listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("install Prometheus exporter")?;
        info!(%addr, "metrics listener started");
    }

    let image = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&args.image)
        .with_context(|| format!("open image {}", args.image.display()))?;

    let bridge = Arc::new(Bridge::new(config.bridge).context("init bridge")?);
    let file = bridge.open().context("open bridge device")?;
    config.daemon.apply(&file)?;
    let (notifier, signals) = SignalChannel::channel();
    file.fasync(Some(Arc::new(notifier)));
    file.ready();
    info!(
        image = %args.image.display(),
        session = file.session_id(),
        queue = config.bridge.queue_capacity,
        block_size = config.bridge.block_size,
        "daemon ready"
    );

    let block_size = config.bridge.block_size;
    let (stop_tx, stop_rx) = watch::channel(false);
    let daemon = tokio::spawn(run_daemon(file, image, block_size, signals, stop_rx));

    let result = match args.loopback {
        Some(blocks) => {
            let worker = TransferWorker::spawn(Arc::clone(&bridge), args.worker_capacity)
                .context("spawn transfer worker")?;
            let loopback = tokio::spawn(run_loopback(worker, blocks, block_size));
            tokio::select! {
                res = loopback => res.context("loopback task")?,
                res = signal::ctrl_c() => {
                    res.context("wait for ctrl-c")?;
                    info!("interrupted, stopping loopback");
                    Ok(())
                }
            }
        }
        None => {
            signal::ctrl_c().await.context("wait for ctrl-c")?;
            info!("interrupted");
            Ok(())
        }
    };

    let _ = stop_tx.send(true);
    daemon.await.context("daemon task")??;
    debug!(status = ?bridge.status(), "bridge stopped");
    result
}

/// Service requests whenever the bridge signals work, until told to stop.
/// Releases the device on the way out so blocked producers fail.
async fn run_daemon(
    file: DeviceFile,
    image: File,
    block_size: usize,
    signals: Receiver<()>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let file = Arc::new(file);
    let image = Arc::new(image);
    let result = loop {
        tokio::select! {
            _ = stop.changed() => break Ok(()),
            res = signals.recv() => {
                if res.is_err() {
                    break Ok(());
                }
            }
        }
        let drained = {
            let file = Arc::clone(&file);
            let image = Arc::clone(&image);
            tokio::task::spawn_blocking(move || {
                file.enable_poll();
                let served = drain(&file, &image, block_size);
                file.disable_poll();
                served
            })
            .await
            .context("join drain task")
            .and_then(|served| served)
        };
        match drained {
            Ok(served) => trace!(served, "queue drained"),
            Err(err) => break Err(err),
        }
    };
    if let Err(err) = &result {
        warn!(error = ?err, "daemon failed");
    }
    // Release waits for in-flight producers to leave the session.
    tokio::task::spawn_blocking(move || match Arc::try_unwrap(file) {
        Ok(file) => file.release(),
        Err(_) => warn!("device still shared at shutdown, releasing on last drop"),
    })
    .await
    .context("join release task")?;
    info!("daemon stopped");
    result
}

fn drain(file: &DeviceFile, image: &File, block_size: usize) -> Result<usize> {
    let mut served = 0;
    while file.has_pending_request() {
        serve_request(file, image, block_size)?;
        served += 1;
    }
    Ok(served)
}

fn serve_request(file: &DeviceFile, image: &File, block_size: usize) -> Result<()> {
    let header = file.read_header().context("read request header")?;
    let offset = header.address as u64 * block_size as u64;
    let mut payload = vec![0u8; header.length];
    match header.kind {
        RequestType::Write => {
            let mut filled = 0;
            while filled < payload.len() {
                let count = file
                    .read(&mut payload[filled..])
                    .context("read request payload")?;
                ensure!(count > 0, "request payload ended early");
                filled += count;
            }
            image
                .write_all_at(&payload, offset)
                .context("write image")?;
        }
        RequestType::Read => {
            read_image(image, offset, &mut payload)?;
            file.write(&payload).context("write response")?;
        }
        RequestType::None => return Ok(()),
    }
    file.block_done().context("complete request")?;
    trace!(
        kind = %header.kind,
        address = header.address,
        len = header.length,
        "request served"
    );
    Ok(())
}

/// Fill `buf` from the image; bytes past the end of the image read as zero.
fn read_image(image: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match image.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("read image"),
        }
    }
    Ok(())
}

/// Host stand-in: write a pattern to each block through the worker and read it back.
async fn run_loopback(worker: TransferWorker, blocks: u64, block_size: usize) -> Result<()> {
    for address in 0..blocks {
        let pattern: Vec<u8> = (0..block_size)
            .map(|i| (address as usize).wrapping_add(i) as u8)
            .collect();
        post(&worker, Transfer::write(address, pattern.clone()))
            .await?
            .completed()
            .await
            .context("loopback write")?;
        let read = post(&worker, Transfer::read(address, block_size))
            .await?
            .completed()
            .await
            .context("loopback read")?;
        ensure!(
            read.data == pattern,
            "block {address} read back different data"
        );
        debug!(address, "loopback block verified");
    }
    info!(blocks, "loopback verified");
    tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("join transfer worker")?;
    Ok(())
}

/// Post a transfer, waiting out backpressure from a full worker backlog.
async fn post(worker: &TransferWorker, transfer: Transfer) -> Result<TransferTicket> {
    loop {
        match worker.post(transfer.clone()) {
            Err(err) if !err.is_terminal() => {
                trace!(backlog = worker.backlog(), %err, "retrying post");
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            other => return other.context("post transfer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyscreen_bridge::{BridgeConfig, TransferBuf};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn daemon_serves_image_and_releases_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let image = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("disk.img"))
            .unwrap();
        let bridge = Arc::new(Bridge::new(BridgeConfig::new(2, 512, 512, 4)).unwrap());
        let file = bridge.open().unwrap();
        let (notifier, signals) = SignalChannel::channel();
        file.fasync(Some(Arc::new(notifier)));
        file.ready();

        let (stop_tx, stop_rx) = watch::channel(false);
        let daemon = tokio::spawn(run_daemon(
            file,
            image.try_clone().unwrap(),
            512,
            signals,
            stop_rx,
        ));

        let producer = {
            let bridge = Arc::clone(&bridge);
            tokio::task::spawn_blocking(move || {
                bridge.submit_transfer(2, TransferBuf::Write(&[5; 1024]))
            })
        };
        producer.await.unwrap().unwrap();

        let mut written = vec![0u8; 1024];
        image.read_exact_at(&mut written, 1024).unwrap();
        assert!(written.iter().all(|&b| b == 5));

        stop_tx.send(true).unwrap();
        daemon.await.unwrap().unwrap();
        assert!(!bridge.status().open);
    }
}
