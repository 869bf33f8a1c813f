//! One-shot outbound actions from the coordinator to a storage node.
//!
//! Every action opens its own connection: handshake, one verb line, at most
//! one reply, close. Nothing is pooled or reused.

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::NetConfig;
use crate::error::{DfsError, DfsResult};
use crate::identity::{NodeIdentity, Role};
use crate::protocol::{StorageRequest, Verb, read_line, read_message, within, write_line, write_message};

/// Where reply lines for the requesting client are delivered.
pub type ReplySink = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone)]
pub struct Action {
    pub target: NodeIdentity,
    pub request: StorageRequest,
}

impl Action {
    pub fn new(target: NodeIdentity, verb: Verb, path: Option<String>, data: Option<String>) -> Self {
        Self {
            target,
            request: StorageRequest::new(verb, path, data),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The verb was delivered; no reply is expected.
    Sent,
    /// The single line the node answered with.
    Reply(String),
    /// The node's identity with freshly sampled stats.
    Refreshed(NodeIdentity),
}

pub struct ActionDispatcher {
    local: NodeIdentity,
    net: NetConfig,
    action: Action,
}

impl ActionDispatcher {
    pub fn new(local: NodeIdentity, net: NetConfig, action: Action) -> Self {
        Self { local, net, action }
    }

    /// Runs the action on its own task. Reply lines and failures are relayed
    /// to `sink` as they happen; the handle also yields the outcome.
    pub fn spawn(self, sink: Option<ReplySink>) -> JoinHandle<DfsResult<Outcome>> {
        tokio::spawn(async move {
            let endpoint = self.action.target.endpoint();
            let verb = self.action.request.verb;
            let result = self.run().await;
            match &result {
                Ok(Outcome::Reply(line)) => relay(sink.as_ref(), line.clone()),
                Ok(_) => {}
                Err(err) => {
                    warn!(%endpoint, %verb, error = %err, "storage action failed");
                    relay(sink.as_ref(), err.to_string());
                }
            }
            result
        })
    }

    pub async fn run(self) -> DfsResult<Outcome> {
        let ActionDispatcher { local, net, action } = self;
        let endpoint = action.target.endpoint();
        let unavailable = |err: std::io::Error| DfsError::storage_unavailable(&endpoint, err);

        let stream = within(net.connect_timeout, TcpStream::connect(endpoint.as_str()))
            .await
            .map_err(unavailable)?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_message(&mut writer, &local).await.map_err(unavailable)?;
        let peer: NodeIdentity = within(net.read_timeout, read_message(&mut reader))
            .await
            .map_err(unavailable)?
            .ok_or_else(|| DfsError::storage_unavailable(&endpoint, "closed before handshake"))?;
        if peer.role != Role::Storage {
            return Err(DfsError::protocol_mismatch(Role::Storage, peer.role));
        }

        let verb = action.request.verb;
        write_line(&mut writer, &action.request.encode())
            .await
            .map_err(unavailable)?;
        debug!(%endpoint, %verb, "storage action sent");

        if verb == Verb::Info {
            let refreshed: NodeIdentity = within(net.read_timeout, read_message(&mut reader))
                .await
                .map_err(unavailable)?
                .ok_or_else(|| DfsError::storage_unavailable(&endpoint, "closed without stats"))?;
            return Ok(Outcome::Refreshed(refreshed));
        }

        if verb.awaits_reply() {
            let line = within(net.read_timeout, read_line(&mut reader))
                .await
                .map_err(unavailable)?
                .ok_or_else(|| DfsError::storage_unavailable(&endpoint, "closed without a reply"))?;
            return Ok(Outcome::Reply(line));
        }

        if let Err(err) = writer.shutdown().await {
            debug!(%endpoint, error = ?err, "storage connection did not shut down cleanly");
        }
        Ok(Outcome::Sent)
    }
}

fn relay(sink: Option<&ReplySink>, line: String) {
    if let Some(sink) = sink {
        if sink.send(line).is_err() {
            debug!("requester went away before the storage reply arrived");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    fn coordinator() -> NodeIdentity {
        NodeIdentity::new("127.0.0.1", 7400, 1, Role::Coordinator)
    }

    fn fast_net() -> NetConfig {
        NetConfig {
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5),
        }
    }

    /// Accepts one connection, answers the handshake as `role`, records the
    /// verb line and replies with `reply` if given.
    async fn fake_node(role: Role, reply: Option<&'static str>) -> (NodeIdentity, JoinHandle<Option<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let identity = NodeIdentity::new("127.0.0.1", port, 2, role);
        let answer = identity.clone();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let _hello: NodeIdentity = read_message(&mut reader).await.expect("read").expect("hello");
            write_message(&mut writer, &answer).await.expect("handshake");
            let line = read_line(&mut reader).await.expect("verb");
            if let Some(reply) = reply {
                write_line(&mut writer, reply).await.expect("reply");
            }
            line
        });
        (identity, handle)
    }

    #[tokio::test]
    async fn read_action_relays_single_reply() {
        let (target, node) = fake_node(Role::Storage, Some("hello world")).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let action = Action::new(target, Verb::Head, Some("a/f.txt".into()), None);

        let outcome = ActionDispatcher::new(coordinator(), fast_net(), action)
            .spawn(Some(tx))
            .await
            .expect("join")
            .expect("action");
        assert_eq!(outcome, Outcome::Reply("hello world".into()));
        assert_eq!(rx.recv().await.as_deref(), Some("hello world"));
        assert_eq!(node.await.expect("node").as_deref(), Some("head a/f.txt"));
    }

    #[tokio::test]
    async fn write_action_does_not_wait() {
        let (target, node) = fake_node(Role::Storage, None).await;
        let action = Action::new(target, Verb::Write, Some("a/f.txt".into()), Some("x y".into()));
        let outcome = ActionDispatcher::new(coordinator(), fast_net(), action)
            .run()
            .await
            .expect("action");
        assert_eq!(outcome, Outcome::Sent);
        assert_eq!(node.await.expect("node").as_deref(), Some("write a/f.txt x y"));
    }

    #[tokio::test]
    async fn non_storage_peer_is_a_protocol_mismatch() {
        let (target, _node) = fake_node(Role::Client, None).await;
        let action = Action::new(target, Verb::Tail, Some("a/f.txt".into()), None);
        let err = ActionDispatcher::new(coordinator(), fast_net(), action)
            .run()
            .await
            .expect_err("mismatch");
        assert!(matches!(err, DfsError::ProtocolMismatch { .. }));
    }

    #[tokio::test]
    async fn unreachable_node_is_reported_to_the_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let target = NodeIdentity::new("127.0.0.1", port, 3, Role::Storage);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let action = Action::new(target, Verb::Create, Some("a/f.txt".into()), None);
        let result = ActionDispatcher::new(coordinator(), fast_net(), action)
            .spawn(Some(tx))
            .await
            .expect("join");
        assert!(matches!(result, Err(DfsError::StorageUnavailable { .. })));
        let line = rx.recv().await.expect("relayed error");
        assert!(line.contains(&format!("127.0.0.1:{port}")), "{line}");
    }
}
