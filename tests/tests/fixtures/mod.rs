//! Fixtures for testing sessraft clusters in-process.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use sessraft::async_trait::async_trait;
use sessraft::membership::Member;
use sessraft::membership::MemberRole;
use sessraft::raft::AppendRequest;
use sessraft::raft::AppendResponse;
use sessraft::raft::ConfigureRequest;
use sessraft::raft::ConfigureResponse;
use sessraft::raft::InstallRequest;
use sessraft::raft::InstallResponse;
use sessraft::raft::OpenSessionRequest;
use sessraft::raft::PollRequest;
use sessraft::raft::PollResponse;
use sessraft::raft::PublishRequest;
use sessraft::raft::VoteRequest;
use sessraft::raft::VoteResponse;
use sessraft::Config;
use sessraft::MemberId;
use sessraft::Raft;
use sessraft::RaftNetwork;
use sessraft::Role;
use sessraft::SessionId;
use sessraft_memstore::ClientRequest;
use sessraft_memstore::ClientResponse;
use sessraft_memstore::KeyChanged;
use sessraft_memstore::LifecycleEvent;
use sessraft_memstore::MemStateMachine;
use sessraft_memstore::MemStore;

/// A concrete server type used during testing.
pub type MemRaft = Raft<ClientRequest, ClientResponse, KeyChanged, RouterNode, MemStore, MemStateMachine>;

static TRACING: Once = Once::new();

/// Install a global tracing subscriber once, honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// The handles a test holds for one spawned server.
pub struct NodeHandles {
    pub raft: MemRaft,
    pub store: Arc<MemStore>,
    pub lifecycle: Arc<Mutex<Vec<LifecycleEvent>>>,
    pub applied: Arc<Mutex<u64>>,
}

impl Clone for NodeHandles {
    fn clone(&self) -> Self {
        Self {
            raft: self.raft.clone(),
            store: self.store.clone(),
            lifecycle: self.lifecycle.clone(),
            applied: self.applied.clone(),
        }
    }
}

/// An in-process network which routes requests between registered servers
/// and can partition members away. It also plays the role of the connected
/// clients: pushed session events are captured here.
pub struct RaftRouter {
    config: Arc<Config>,
    nodes: Mutex<BTreeMap<MemberId, NodeHandles>>,
    isolated: Mutex<HashSet<MemberId>>,
    published: Mutex<Vec<PublishRequest<KeyChanged>>>,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: Mutex::new(BTreeMap::new()),
            isolated: Mutex::new(HashSet::new()),
            published: Mutex::new(Vec::new()),
        })
    }

    /// Spawn a new server and register it with the router.
    pub fn new_node(self: &Arc<Self>, id: MemberId) -> NodeHandles {
        let network = Arc::new(RouterNode {
            id,
            router: self.clone(),
        });
        let store = Arc::new(MemStore::new());
        let sm = MemStateMachine::new();
        let lifecycle = sm.lifecycle_handle();
        let applied = sm.applied_handle();
        let raft = Raft::new(id, self.config.clone(), network, store.clone(), sm);
        let handles = NodeHandles {
            raft,
            store,
            lifecycle,
            applied,
        };
        self.nodes.lock().unwrap().insert(id, handles.clone());
        handles
    }

    pub fn get(&self, id: MemberId) -> Result<NodeHandles> {
        self.nodes
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("node {} is not registered", id))
    }

    /// Cut a member off from all peers, both directions.
    pub fn isolate(&self, id: MemberId) {
        tracing::info!(id, "isolating node");
        self.isolated.lock().unwrap().insert(id);
    }

    /// Restore a previously isolated member.
    pub fn restore(&self, id: MemberId) {
        tracing::info!(id, "restoring node");
        self.isolated.lock().unwrap().remove(&id);
    }

    fn check_reachable(&self, source: MemberId, target: MemberId) -> Result<()> {
        let isolated = self.isolated.lock().unwrap();
        if isolated.contains(&source) || isolated.contains(&target) {
            return Err(anyhow!("network partition between {} and {}", source, target));
        }
        Ok(())
    }

    /// The server currently reporting itself leader, preferring the highest
    /// term when old leaders have not yet noticed their deposition.
    pub fn current_leader(&self) -> Option<MemberId> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .values()
            .map(|n| n.raft.metrics().borrow().clone())
            .filter(|m| m.role == Role::Leader)
            .max_by_key(|m| m.current_term)
            .map(|m| m.id)
    }

    /// Wait until some registered server reports itself leader.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> Result<MemberId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.current_leader() {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("{}: no leader elected within {:?}", msg, timeout));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// All event pushes captured so far for the given session.
    pub fn published_for(&self, session: SessionId) -> Vec<PublishRequest<KeyChanged>> {
        self.published.lock().unwrap().iter().filter(|p| p.session == session).cloned().collect()
    }
}

/// The per-server network endpoint handed to `Raft::new`; it knows its own
/// ID so partitions cut both directions.
pub struct RouterNode {
    id: MemberId,
    router: Arc<RaftRouter>,
}

#[async_trait]
impl RaftNetwork<ClientRequest, KeyChanged> for RouterNode {
    async fn append_entries(&self, target: MemberId, rpc: AppendRequest<ClientRequest>) -> Result<AppendResponse> {
        self.router.check_reachable(self.id, target)?;
        let node = self.router.get(target)?;
        Ok(node.raft.append_entries(rpc).await?)
    }

    async fn install_snapshot(&self, target: MemberId, rpc: InstallRequest) -> Result<InstallResponse> {
        self.router.check_reachable(self.id, target)?;
        let node = self.router.get(target)?;
        Ok(node.raft.install_snapshot(rpc).await?)
    }

    async fn vote(&self, target: MemberId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.router.check_reachable(self.id, target)?;
        let node = self.router.get(target)?;
        Ok(node.raft.vote(rpc).await?)
    }

    async fn poll(&self, target: MemberId, rpc: PollRequest) -> Result<PollResponse> {
        self.router.check_reachable(self.id, target)?;
        let node = self.router.get(target)?;
        Ok(node.raft.poll(rpc).await?)
    }

    async fn configure(&self, target: MemberId, rpc: ConfigureRequest) -> Result<ConfigureResponse> {
        self.router.check_reachable(self.id, target)?;
        let node = self.router.get(target)?;
        Ok(node.raft.configure(rpc).await?)
    }

    async fn publish(&self, target: MemberId, rpc: PublishRequest<KeyChanged>) -> Result<()> {
        self.router.check_reachable(self.id, target)?;
        // The router stands in for the connected client.
        self.router.published.lock().unwrap().push(rpc);
        Ok(())
    }
}

/// A config suitable for fast tests.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test")
            .election_timeout(150)
            .heartbeat_interval(50)
            .validate()
            .expect("config must be valid"),
    )
}

/// Spawn and initialize a cluster of `n` active members with IDs `0..n`.
pub async fn new_cluster(router: &Arc<RaftRouter>, n: u64) -> Result<MemberId> {
    let members: Vec<Member> = (0..n).map(|id| Member::new(id, MemberRole::Active)).collect();
    for id in 0..n {
        router.new_node(id);
    }
    for id in 0..n {
        router.get(id)?.raft.initialize(members.clone()).await.context("initialize")?;
    }
    let leader = router.wait_for_leader(Duration::from_secs(5), "cluster formation").await?;
    Ok(leader)
}

/// Open a session through the given server, bound to the `kv` state machine.
pub async fn open_session(raft: &MemRaft, name: &str, timeout: u64) -> Result<SessionId> {
    let res = raft
        .open_session(OpenSessionRequest {
            member: raft.id(),
            name: name.to_string(),
            kind: "kv".to_string(),
            timeout,
        })
        .await
        .map_err(|err| anyhow!("open session: {}", err))?;
    Ok(res.session)
}
