use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

use crate::{
    block_store::{BlockStore, WriteMode},
    config::StorageConfig,
    error::{DfsError, DfsResult},
    identity::{NodeIdentity, Role, load_or_generate_id},
    lifecycle::{Exit, Lifecycle},
    protocol::{
        HEARTBEAT_ACK, StorageRequest, Verb, heartbeat_line, read_line, read_message, within,
        write_line, write_message,
    },
    resources::{ResourceProbe, SystemProbe},
};

pub struct StorageNode {
    listener: TcpListener,
    state: Arc<StorageState>,
}

impl StorageNode {
    pub async fn bind(config: StorageConfig) -> Result<Self> {
        Self::bind_with_probe(config, Box::new(SystemProbe)).await
    }

    /// Opens the block store (an unreadable journal aborts startup) and binds
    /// the listener. The coordinator is not contacted until
    /// [`StorageNode::run_until`].
    pub async fn bind_with_probe(config: StorageConfig, probe: Box<dyn ResourceProbe>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let id = load_or_generate_id(&config.id_path())?;
        let blocks = BlockStore::open(&config).await?;

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("binding {}", config.listen))?;
        let local = listener.local_addr()?;
        let identity = NodeIdentity::new(config.advertised_address(), local.port(), id, Role::Storage);

        let state = StorageState {
            identity,
            config,
            blocks,
            probe: Arc::from(probe),
            lifecycle: Lifecycle::new(),
        };
        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<StorageState> {
        Arc::clone(&self.state)
    }

    /// Registers with the coordinator, then serves coordinator actions until
    /// `shutdown` resolves or a `shutdown` action completes its grace period.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let StorageNode { listener, state } = self;
        let link = connect_to_coordinator(&state)
            .await
            .with_context(|| format!("registering with coordinator {}", state.config.coordinator))?;
        info!(identity = %state.identity, coordinator = %link.coordinator, "storage node registered");

        let heartbeat = tokio::spawn(run_heartbeat(Arc::clone(&state), link));
        tokio::pin!(shutdown);

        let outcome = loop {
            select! {
                _ = &mut shutdown => {
                    info!("storage node shutting down");
                    if let Err(err) = state.blocks.save_journal().await {
                        error!(error = %err, "could not write the journal on the way out");
                    }
                    break Ok(());
                }
                exit = state.lifecycle.stopped() => {
                    break match exit {
                        Exit::Requested => {
                            info!("storage node stopped by shutdown action");
                            Ok(())
                        }
                        Exit::Fatal(reason) => Err(anyhow::anyhow!("storage node stopped: {reason}")),
                    };
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        };

        heartbeat.abort();
        outcome
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub struct StorageState {
    identity: NodeIdentity,
    config: StorageConfig,
    blocks: BlockStore,
    probe: Arc<dyn ResourceProbe>,
    lifecycle: Lifecycle,
}

impl StorageState {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    /// This node's identity with freshly sampled resource figures. Sampling
    /// runs on the blocking pool.
    pub async fn refreshed_identity(&self) -> NodeIdentity {
        let probe = Arc::clone(&self.probe);
        let disk_root = self.config.data_dir.clone();
        match tokio::task::spawn_blocking(move || probe.sample(&disk_root)).await {
            Ok(stats) => self.identity.clone().with_stats(stats),
            Err(err) => {
                warn!(error = ?err, "resource probe failed");
                self.identity.clone()
            }
        }
    }
}

struct CoordinatorLink {
    coordinator: NodeIdentity,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

async fn connect_to_coordinator(state: &StorageState) -> DfsResult<CoordinatorLink> {
    let net = state.config.net;
    let stream = within(net.connect_timeout, TcpStream::connect(state.config.coordinator)).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(&mut writer, &state.refreshed_identity().await).await?;
    let coordinator: NodeIdentity = within(net.read_timeout, read_message(&mut reader))
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed before handshake"))?;
    if coordinator.role != Role::Coordinator {
        return Err(DfsError::protocol_mismatch(Role::Coordinator, coordinator.role));
    }

    Ok(CoordinatorLink {
        coordinator,
        reader,
        writer,
    })
}

/// Keeps the registration connection alive. A lost coordinator stops the
/// heartbeat but not the node.
async fn run_heartbeat(state: Arc<StorageState>, mut link: CoordinatorLink) {
    let mut ticker = interval(state.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let line = heartbeat_line(state.identity.id);

    loop {
        ticker.tick().await;
        let result = async {
            write_line(&mut link.writer, &line).await?;
            within(state.config.net.read_timeout, read_line(&mut link.reader)).await
        }
        .await;

        match result {
            Ok(Some(ack)) if ack == HEARTBEAT_ACK => debug!("heartbeat acknowledged"),
            Ok(Some(other)) => warn!(reply = %other, "unexpected heartbeat reply"),
            Ok(None) => {
                warn!(coordinator = %link.coordinator, "coordinator closed the heartbeat connection");
                return;
            }
            Err(err) => {
                warn!(coordinator = %link.coordinator, error = ?err, "heartbeat failed");
                return;
            }
        }
    }
}

fn handle_accept_result(result: io::Result<(TcpStream, SocketAddr)>, state: &Arc<StorageState>) {
    match result {
        Ok((stream, peer)) => {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, &state).await {
                    warn!(peer = %peer, error = %err, "connection closed with error");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn handle_connection(stream: TcpStream, state: &StorageState) -> DfsResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let net = state.config.net;

    let hello: NodeIdentity = within(net.read_timeout, read_message(&mut reader))
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed before handshake"))?;
    write_message(&mut writer, &state.identity).await?;
    if hello.role != Role::Coordinator {
        let err = DfsError::protocol_mismatch(Role::Coordinator, hello.role);
        respond(&mut writer, &err.to_string()).await;
        return Err(err);
    }

    serve_actions(state, &mut reader, &mut writer).await
}

/// Serves verb lines until the peer closes. Read, remove, info and shutdown
/// actions end the connection after their one reply.
async fn serve_actions<R, W>(state: &StorageState, reader: &mut R, writer: &mut W) -> DfsResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = match within(state.config.net.idle_timeout, read_line(reader)).await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(err) if is_hangup(&err) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let request = match StorageRequest::parse(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "rejected action");
                respond(writer, &err.to_string()).await;
                continue;
            }
        };
        let verb = request.verb;

        match perform(state, request, writer).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                error!(error = %err, "cannot persist the block listing, stopping");
                respond(writer, &format!("FATAL: {err}")).await;
                state.lifecycle.fatal(err.to_string());
                return Err(err);
            }
            Err(err) => {
                info!(%verb, error = %err, "action failed");
                respond(writer, &err.to_string()).await;
            }
        }

        if verb.closes_connection() {
            return Ok(());
        }
    }
}

async fn perform<W>(state: &StorageState, request: StorageRequest, writer: &mut W) -> DfsResult<()>
where
    W: AsyncWrite + Unpin,
{
    let path = request.path.as_deref().unwrap_or_default();
    let data = request.data.as_deref().unwrap_or_default();
    let blocks = &state.blocks;

    let line = match request.verb {
        Verb::Create => {
            let block = blocks.create_block_list(path).await?;
            format!("Block listing created for {path} in block file {block}.")
        }
        Verb::Write | Verb::Append => {
            let mode = if request.verb == Verb::Write {
                WriteMode::Overwrite
            } else {
                WriteMode::Append
            };
            let block = blocks.write(path, data, mode).await?;
            format!("Data was successfully written for {path} into block file {block}.")
        }
        Verb::Head => blocks.read_head(path).await?,
        Verb::Tail => blocks.read_tail(path).await?,
        Verb::Remove => {
            let count = blocks.remove(path).await?;
            info!(%path, blocks = count, "file removed");
            format!("The file {path} was successfully deleted.")
        }
        Verb::Info => {
            write_message(writer, &state.refreshed_identity().await).await?;
            return Ok(());
        }
        Verb::Shutdown => {
            blocks.save_journal().await?;
            let grace = state.config.shutdown_grace;
            let lifecycle = state.lifecycle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                lifecycle.request();
            });
            info!(?grace, "shutdown action received");
            format!(
                "Storage node {} wrote its journal to {} and stops in {} second(s).",
                state.identity.endpoint(),
                blocks.journal_path().display(),
                grace.as_secs()
            )
        }
    };

    respond(writer, &line).await;
    Ok(())
}

/// Best-effort status line. Fire-and-forget peers may already be gone.
async fn respond<W>(writer: &mut W, line: &str)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = write_line(writer, line).await {
        debug!(error = ?err, "peer left before the reply was written");
    }
}

fn is_hangup(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeResourceStats;
    use crate::resources::StaticProbe;
    use tempfile::TempDir;

    async fn state(dir: &TempDir) -> Arc<StorageState> {
        let config = StorageConfig {
            listen: "127.0.0.1:0".parse().expect("addr"),
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let probe = StaticProbe(NodeResourceStats {
            cores: 2,
            ..Default::default()
        });
        StorageNode::bind_with_probe(config, Box::new(probe))
            .await
            .expect("bind")
            .state()
    }

    /// Feeds `input` to the action loop and returns everything written back.
    async fn serve(state: &StorageState, input: &str) -> String {
        let mut reader = BufReader::new(input.as_bytes());
        let mut output = Vec::new();
        serve_actions(state, &mut reader, &mut output).await.expect("serve");
        String::from_utf8(output).expect("utf8")
    }

    #[tokio::test]
    async fn data_verbs_keep_the_connection_open() {
        let dir = TempDir::new().expect("tempdir");
        let state = state(&dir).await;
        let output = serve(&state, "create a/f.txt\nwrite a/f.txt hello world\nhead a/f.txt\nappend a/f.txt ignored\n").await;
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Block listing created for a/f.txt"));
        assert!(lines[1].starts_with("Data was successfully written for a/f.txt"));
        assert_eq!(lines[2], "hello world");
    }

    #[tokio::test]
    async fn failures_are_reported_as_one_line() {
        let dir = TempDir::new().expect("tempdir");
        let state = state(&dir).await;
        let output = serve(&state, "bogus\ncreate a/f\ncreate a/f\ntail missing\n").await;
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("unknown command"));
        assert!(lines[2].contains("already exists"));
        assert_eq!(lines[3], "no such file: missing");
    }

    #[tokio::test]
    async fn info_replies_with_refreshed_identity() {
        let dir = TempDir::new().expect("tempdir");
        let state = state(&dir).await;
        let output = serve(&state, "sysinfo\n").await;
        let identity: NodeIdentity = serde_json::from_str(output.trim()).expect("identity json");
        assert_eq!(identity.role, Role::Storage);
        assert_eq!(identity.stats.map(|stats| stats.cores), Some(2));
    }

    #[tokio::test]
    async fn remove_deletes_and_closes() {
        let dir = TempDir::new().expect("tempdir");
        let state = state(&dir).await;
        serve(&state, "create a/f\n").await;
        let output = serve(&state, "remove a/f\nhead a/f\n").await;
        assert_eq!(output.trim(), "The file a/f was successfully deleted.");
        assert!(state.blocks().listing("a/f").is_none());
    }
}
