use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    block::Block,
    command::{ClientCommand, HELP},
    config::CoordinatorConfig,
    dispatcher::{Action, ActionDispatcher, Outcome, ReplySink},
    error::{DfsError, DfsResult},
    identity::{NodeIdentity, Role, load_or_generate_id},
    journal::JournalStore,
    lifecycle::{Exit, Lifecycle},
    namespace::{BlockPlacement, Listing, NamespaceSnapshot, NamespaceStore},
    placement::{PlacementPolicy, RandomPlacement},
    protocol::{HEARTBEAT, HEARTBEAT_ACK, Verb, read_line, read_message, within, write_line, write_message},
    registry::NodeRegistry,
};

pub struct Coordinator {
    listener: TcpListener,
    state: Arc<CoordinatorState>,
}

impl Coordinator {
    /// Prepares the data directory, restores the namespace from the journal
    /// and binds the listener. An unreadable journal aborts startup.
    pub async fn bind(config: CoordinatorConfig) -> Result<Self> {
        let placement = RandomPlacement::new(config.replication_factor);
        Self::bind_with_placement(config, Box::new(placement)).await
    }

    pub async fn bind_with_placement(
        config: CoordinatorConfig,
        placement: Box<dyn PlacementPolicy>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let id = load_or_generate_id(&config.id_path())?;

        let journal = JournalStore::new(config.journal_path());
        let snapshot = journal.load().await?.unwrap_or_default();
        let namespace = NamespaceStore::from_snapshot(config.owner.clone(), snapshot);

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("binding {}", config.listen))?;
        let local = listener.local_addr()?;
        let identity = NodeIdentity::new(local.ip().to_string(), local.port(), id, Role::Coordinator);
        info!(%identity, directories = namespace.dir_count(), "coordinator ready");

        let state = CoordinatorState {
            identity,
            config,
            namespace,
            registry: NodeRegistry::new(),
            placement,
            journal,
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

    pub fn state(&self) -> Arc<CoordinatorState> {
        Arc::clone(&self.state)
    }

    /// Serves until `shutdown` resolves or a client shuts the cluster down.
    /// A fatal journal failure ends the loop with an error.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Coordinator { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                exit = state.lifecycle.stopped() => {
                    match exit {
                        Exit::Requested => {
                            info!("coordinator stopped by shutdown command");
                            break;
                        }
                        Exit::Fatal(reason) => anyhow::bail!("coordinator stopped: {reason}"),
                    }
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
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

async fn handle_shutdown(state: &CoordinatorState) {
    info!("coordinator shutting down");
    if let Err(err) = state.save_journal().await {
        error!(error = %err, "could not write the journal on the way out");
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<CoordinatorState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<CoordinatorState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, &state).await {
            warn!(peer = %peer, error = %err, "connection closed with error");
        }
    });
}

/// Everything a coordinator connection handler can reach.
pub struct CoordinatorState {
    identity: NodeIdentity,
    config: CoordinatorConfig,
    namespace: NamespaceStore,
    registry: NodeRegistry,
    placement: Box<dyn PlacementPolicy>,
    journal: JournalStore<NamespaceSnapshot>,
    lifecycle: Lifecycle,
}

impl CoordinatorState {
    pub fn namespace(&self) -> &NamespaceStore {
        &self.namespace
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub async fn save_journal(&self) -> DfsResult<()> {
        self.journal.save_with(|| self.namespace.snapshot()).await
    }

    fn dispatch(
        &self,
        target: NodeIdentity,
        verb: Verb,
        path: Option<&str>,
        data: Option<&str>,
        sink: &ReplySink,
    ) -> JoinHandle<DfsResult<Outcome>> {
        let action = Action::new(target, verb, path.map(str::to_string), data.map(str::to_string));
        ActionDispatcher::new(self.identity.clone(), self.config.net, action).spawn(Some(sink.clone()))
    }
}

async fn handle_connection(stream: TcpStream, state: &CoordinatorState) -> DfsResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let hello: NodeIdentity = within(state.config.net.read_timeout, read_message(&mut reader))
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed before handshake"))?;
    write_message(&mut writer, &state.identity).await?;

    match hello.role {
        Role::Client => run_client_session(state, hello, &mut reader, writer).await,
        Role::Storage => run_storage_session(state, hello, &mut reader, &mut writer).await,
        Role::Coordinator => {
            let err = DfsError::protocol_mismatch("client or storage", hello.role);
            write_line(&mut writer, &err.to_string()).await?;
            Err(err)
        }
    }
}

async fn run_storage_session<R, W>(
    state: &CoordinatorState,
    node: NodeIdentity,
    reader: &mut R,
    writer: &mut W,
) -> DfsResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    state.registry.register_storage(node.clone());
    info!(%node, nodes = state.registry.storage_count(), "storage node registered");

    loop {
        let line = match within(state.config.net.idle_timeout, read_line(reader)).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                info!(%node, "storage connection idle, closing");
                break;
            }
            Err(err) => return Err(err.into()),
        };

        let Some(verb) = line.split_whitespace().next() else {
            continue;
        };
        if verb.eq_ignore_ascii_case(HEARTBEAT) {
            debug!(%node, "heartbeat");
            write_line(writer, HEARTBEAT_ACK).await?;
        } else {
            let err = DfsError::UnknownCommand(line.clone());
            warn!(%node, error = %err, "unexpected line from storage node");
            write_line(writer, &err.to_string()).await?;
        }
    }

    // Disconnected nodes stay registered.
    info!(%node, "storage connection closed");
    Ok(())
}

async fn run_client_session<R>(
    state: &CoordinatorState,
    client: NodeIdentity,
    reader: &mut R,
    mut writer: OwnedWriteHalf,
) -> DfsResult<()>
where
    R: AsyncBufRead + Unpin,
{
    if let Err(err) = state.registry.attach_client(client.clone()) {
        write_line(&mut writer, &err.to_string()).await?;
        return Err(err);
    }
    info!(%client, "client attached");

    let (outbox, inbox) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_replies(inbox, writer));

    let result = run_client_commands(state, reader, &outbox).await;

    state.registry.detach_client_if(&client);
    info!(%client, "client detached");

    // The forwarder ends once in-flight actions drop their copies of the
    // outbox.
    drop(outbox);
    if let Err(err) = forwarder.await {
        debug!(error = ?err, "reply forwarder panicked");
    }
    result
}

async fn forward_replies(mut inbox: mpsc::UnboundedReceiver<String>, mut writer: OwnedWriteHalf) {
    while let Some(line) = inbox.recv().await {
        if let Err(err) = write_line(&mut writer, &line).await {
            debug!(error = ?err, "failed to deliver reply to client");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

enum Flow {
    Continue,
    Close,
}

async fn run_client_commands<R>(
    state: &CoordinatorState,
    reader: &mut R,
    outbox: &ReplySink,
) -> DfsResult<()>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = read_line(reader).await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match ClientCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                reply(outbox, err.to_string());
                continue;
            }
        };
        debug!(?command, "client command");

        match execute(state, command, outbox).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(err) if err.is_fatal() => {
                error!(error = %err, "cannot persist the namespace, stopping");
                reply(outbox, format!("FATAL: {err}"));
                state.lifecycle.fatal(err.to_string());
                return Err(err);
            }
            Err(err) => {
                info!(error = %err, "command rejected");
                reply(outbox, err.to_string());
            }
        }
    }
    Ok(())
}

fn reply(outbox: &ReplySink, line: impl Into<String>) {
    if outbox.send(line.into()).is_err() {
        debug!("client went away before its reply was written");
    }
}

async fn execute(
    state: &CoordinatorState,
    command: ClientCommand,
    outbox: &ReplySink,
) -> DfsResult<Flow> {
    match command {
        ClientCommand::List { prefix } => match state.namespace.list(&prefix)? {
            Listing::NoRootDirectories => {
                reply(outbox, "There are no root directories. Make a new directory.");
            }
            Listing::Entries(lines) if lines.is_empty() => {
                reply(outbox, format!("No directories match '{prefix}'."));
            }
            Listing::Entries(lines) => lines.into_iter().for_each(|line| reply(outbox, line)),
        },
        ClientCommand::Save => {
            state.save_journal().await?;
            reply(outbox, journal_written(state));
        }
        ClientCommand::Mkdirs { path } => {
            let created = state.namespace.mkdirs(&path)?;
            info!(?created, "directories created");
            reply(outbox, format!("New directory {path} was created."));
        }
        ClientCommand::Mkdir { path } => {
            state.namespace.mkdir(&path)?;
            info!(%path, "directory created");
            reply(outbox, format!("New directory {path} was created."));
        }
        ClientCommand::Rmdir { path } => remove_directories(state, &path, outbox)?,
        ClientCommand::Create { path } => create_file(state, &path, outbox)?,
        ClientCommand::Write { path, data } => write_file(state, Verb::Write, &path, &data, outbox)?,
        ClientCommand::Append { path, data } => write_file(state, Verb::Append, &path, &data, outbox)?,
        ClientCommand::Head { path } => read_file(state, Verb::Head, &path, outbox)?,
        ClientCommand::Tail { path } => read_file(state, Verb::Tail, &path, outbox)?,
        ClientCommand::Sysinfo => system_info(state, outbox).await,
        ClientCommand::Format => {
            state.namespace.format();
            state.journal.remove().await?;
            info!("namespace formatted");
            reply(outbox, "The namespace has been formatted.");
        }
        ClientCommand::Help => HELP.iter().for_each(|line| reply(outbox, *line)),
        ClientCommand::Logout => {
            reply(outbox, "Goodbye.");
            return Ok(Flow::Close);
        }
        ClientCommand::Shutdown => {
            shutdown_cluster(state, outbox).await?;
            return Ok(Flow::Close);
        }
    }
    Ok(Flow::Continue)
}

fn journal_written(state: &CoordinatorState) -> String {
    format!("The journal was written to disk @{}", state.journal.path().display())
}

fn remove_directories(state: &CoordinatorState, path: &str, outbox: &ReplySink) -> DfsResult<()> {
    let removed = state.namespace.rmdir(path)?;
    if removed.directories.is_empty() {
        reply(outbox, format!("No directories match '{path}'."));
        return Ok(());
    }

    for file in &removed.files {
        for node in file.record.replicas() {
            state.dispatch(node, Verb::Remove, Some(&file.path), None, outbox);
        }
    }
    info!(%path, directories = removed.directories.len(), files = removed.files.len(), "directories removed");
    for key in removed.directories {
        reply(outbox, format!("Removed {key}."));
    }
    Ok(())
}

fn create_file(state: &CoordinatorState, path: &str, outbox: &ReplySink) -> DfsResult<()> {
    state.namespace.ensure_creatable(path)?;
    let replicas = state.placement.place(&state.registry.storage_nodes())?;
    let placement = BlockPlacement::new(Block::allocate(), replicas.clone());
    state.namespace.create_file(path, vec![placement])?;

    info!(%path, replicas = replicas.len(), "file created");
    reply(
        outbox,
        format!("New file {path} was created on {} storage node(s).", replicas.len()),
    );
    for node in replicas {
        state.dispatch(node, Verb::Create, Some(path), None, outbox);
    }
    Ok(())
}

fn write_file(
    state: &CoordinatorState,
    verb: Verb,
    path: &str,
    data: &str,
    outbox: &ReplySink,
) -> DfsResult<()> {
    let record = state.namespace.locate(path)?;
    if state.registry.storage_count() == 0 {
        return Err(DfsError::NoStorageAvailable);
    }
    state.namespace.touch(path)?;

    let replicas = record.replicas();
    for node in &replicas {
        state.dispatch(node.clone(), verb, Some(path), Some(data), outbox);
    }
    reply(
        outbox,
        format!("Sent {verb} for {path} to {} replica(s).", replicas.len()),
    );
    Ok(())
}

fn read_file(state: &CoordinatorState, verb: Verb, path: &str, outbox: &ReplySink) -> DfsResult<()> {
    let record = state.namespace.locate(path)?;
    let target = state
        .placement
        .read_target(&record)
        .ok_or(DfsError::NoStorageAvailable)?;
    state.dispatch(target, verb, Some(path), None, outbox);
    Ok(())
}

async fn system_info(state: &CoordinatorState, outbox: &ReplySink) {
    let actions: Vec<_> = state
        .registry
        .storage_nodes()
        .into_iter()
        .map(|node| state.dispatch(node, Verb::Info, None, None, outbox))
        .collect();

    for result in join_all(actions).await {
        if let Ok(Ok(Outcome::Refreshed(node))) = result {
            if !state.registry.update_storage(node.clone()) {
                debug!(%node, "stats arrived for an unknown node");
            }
        }
    }

    for line in state.registry.cluster_stats().render() {
        reply(outbox, line);
    }
}

async fn shutdown_cluster(state: &CoordinatorState, outbox: &ReplySink) -> DfsResult<()> {
    state.save_journal().await?;
    reply(outbox, journal_written(state));

    let nodes = state.registry.storage_nodes();
    info!(nodes = nodes.len(), grace = ?state.config.shutdown_grace, "cluster shutdown requested");
    for node in nodes {
        state.dispatch(node, Verb::Shutdown, None, None, outbox);
    }
    reply(
        outbox,
        format!(
            "The cluster is shutting down in {} second(s).",
            state.config.shutdown_grace.as_secs()
        ),
    );

    let lifecycle = state.lifecycle.clone();
    let grace = state.config.shutdown_grace;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        lifecycle.request();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::config::COORDINATOR_JOURNAL;

    fn config(dir: &TempDir) -> CoordinatorConfig {
        CoordinatorConfig {
            listen: "127.0.0.1:0".parse().expect("addr"),
            data_dir: dir.path().to_path_buf(),
            owner: "tester".into(),
            shutdown_grace: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn bind(dir: &TempDir) -> Coordinator {
        Coordinator::bind(config(dir)).await.expect("bind")
    }

    /// Feeds `input` through the client command loop.
    async fn session(state: &CoordinatorState, input: &str) -> (DfsResult<()>, Vec<String>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reader = input.as_bytes();
        let result = run_client_commands(state, &mut reader, &tx).await;
        drop(tx);
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        (result, lines)
    }

    /// Puts a non-empty directory where the journal file belongs.
    async fn block_journal(state: &CoordinatorState) {
        tokio::fs::create_dir_all(state.journal.path().join("nested"))
            .await
            .expect("mkdir");
    }

    async fn run(state: &CoordinatorState, line: &str) -> (DfsResult<Flow>, Vec<String>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let command = ClientCommand::parse(line).expect("parse");
        let flow = execute(state, command, &tx).await;
        drop(tx);
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        (flow, lines)
    }

    #[tokio::test]
    async fn directory_commands_reply_with_status_lines() {
        let dir = TempDir::new().expect("tempdir");
        let coordinator = bind(&dir).await;
        let state = coordinator.state();

        let (_, lines) = run(&state, "list").await;
        assert_eq!(lines, vec!["There are no root directories. Make a new directory."]);

        let (_, lines) = run(&state, "mkdirs a/b").await;
        assert_eq!(lines, vec!["New directory a/b was created."]);

        let (flow, _) = run(&state, "mkdir a").await;
        assert!(matches!(flow, Err(DfsError::AlreadyExists(_))));

        let (_, lines) = run(&state, "rmdir a").await;
        assert_eq!(lines, vec!["Removed a.", "Removed a/b."]);
    }

    #[tokio::test]
    async fn create_without_storage_changes_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let coordinator = bind(&dir).await;
        let state = coordinator.state();
        run(&state, "mkdir a").await;

        let (flow, _) = run(&state, "create a/f.txt").await;
        assert!(matches!(flow, Err(DfsError::NoStorageAvailable)));
        assert!(matches!(
            state.namespace().locate("a/f.txt"),
            Err(DfsError::NoSuchFile(_))
        ));

        let (flow, _) = run(&state, "write a/f.txt hi").await;
        assert!(matches!(flow, Err(DfsError::NoSuchFile(_))));
    }

    #[tokio::test]
    async fn save_and_restart_restores_namespace() {
        let dir = TempDir::new().expect("tempdir");
        {
            let coordinator = bind(&dir).await;
            let state = coordinator.state();
            run(&state, "mkdirs x/y").await;
            let (flow, lines) = run(&state, "save").await;
            assert!(flow.is_ok());
            assert!(lines[0].starts_with("The journal was written to disk @"));
        }

        let coordinator = bind(&dir).await;
        let state = coordinator.state();
        assert!(state.namespace().contains_dir("x/y"));

        run(&state, "format").await;
        drop(coordinator);
        let coordinator = bind(&dir).await;
        assert_eq!(coordinator.state().namespace().dir_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_command_stops_the_server() {
        let dir = TempDir::new().expect("tempdir");
        let coordinator = bind(&dir).await;
        let state = coordinator.state();
        let server = tokio::spawn(coordinator.run_until(std::future::pending()));

        let (flow, lines) = run(&state, "shutdown").await;
        assert!(matches!(flow, Ok(Flow::Close)));
        assert_eq!(lines.len(), 2);

        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server stopped")
            .expect("join");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failed_save_stops_the_coordinator() {
        let dir = TempDir::new().expect("tempdir");
        let coordinator = bind(&dir).await;
        let state = coordinator.state();
        block_journal(&state).await;
        let server = tokio::spawn(coordinator.run_until(std::future::pending()));

        let (result, lines) = session(&state, "mkdir a\nsave\nmkdir b\n").await;
        assert!(matches!(result, Err(DfsError::Journal { .. })));
        assert_eq!(lines[0], "New directory a was created.");
        assert!(lines[1].starts_with("FATAL: journal"));
        assert_eq!(lines.len(), 2);
        assert!(!state.namespace().contains_dir("b"));

        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server stopped")
            .expect("join");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn corrupt_journal_aborts_startup() {
        let dir = TempDir::new().expect("tempdir");
        tokio::fs::write(dir.path().join(COORDINATOR_JOURNAL), b"not a journal")
            .await
            .expect("write");

        let Err(err) = Coordinator::bind(config(&dir)).await else {
            panic!("startup should fail on a corrupt journal");
        };
        assert!(format!("{err:#}").contains(COORDINATOR_JOURNAL));
    }

    #[tokio::test]
    async fn failed_format_cleanup_is_not_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let coordinator = bind(&dir).await;
        let state = coordinator.state();
        block_journal(&state).await;

        let (result, lines) = session(&state, "mkdir a\nformat\nmkdir c\n").await;
        assert!(result.is_ok());
        assert_eq!(lines.len(), 3);
        assert!(!lines[1].starts_with("FATAL"));
        assert_eq!(lines[2], "New directory c was created.");
        assert!(state.lifecycle.exit().is_none());
    }
}
