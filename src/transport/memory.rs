//! In-process cluster simulator.
//!
//! Emulates slot ownership, replica reads, MOVED/ASK redirection, node
//! outages and the subset of the keyspace the cache client uses (strings
//! with TTL, hashes and sorted sets). Used by the test suites and by anyone
//! who wants to exercise the client without a live deployment.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::{Connection, Connector};
use crate::cluster::slot::{hash_slot, SLOT_COUNT};
use crate::cluster::{Command, Endpoint, Reply};
use crate::error::{Error, Result};

/// Shared handle on a simulated cluster
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

struct ClusterState {
    topology: RwLock<SimTopology>,
    keyspace: Mutex<Keyspace>,
    log: Mutex<Vec<(Endpoint, String)>>,
    connections_opened: AtomicUsize,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            topology: RwLock::new(SimTopology::default()),
            keyspace: Mutex::new(Keyspace::default()),
            log: Mutex::new(Vec::new()),
            connections_opened: AtomicUsize::new(0),
        }
    }
}

struct SimTopology {
    owners: Vec<Option<Endpoint>>,
    replicas: HashMap<Endpoint, Vec<Endpoint>>,
    migrating: HashMap<u16, Endpoint>,
    down: HashSet<Endpoint>,
    latency: HashMap<Endpoint, Duration>,
    sentinel_masters: HashMap<String, Endpoint>,
}

impl Default for SimTopology {
    fn default() -> Self {
        Self {
            owners: vec![None; SLOT_COUNT as usize],
            replicas: HashMap::new(),
            migrating: HashMap::new(),
            down: HashSet::new(),
            latency: HashMap::new(),
            sentinel_masters: HashMap::new(),
        }
    }
}

impl InMemoryCluster {
    /// Cluster with no slots assigned
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster whose slots are split evenly across `masters`
    pub fn with_masters(masters: &[Endpoint]) -> Self {
        let cluster = Self::new();
        if masters.is_empty() {
            return cluster;
        }
        let per_node = SLOT_COUNT as usize / masters.len();
        for (i, master) in masters.iter().enumerate() {
            let start = i * per_node;
            let end = if i + 1 == masters.len() {
                SLOT_COUNT as usize - 1
            } else {
                start + per_node - 1
            };
            cluster.assign_slots(start as u16..=end as u16, master);
        }
        cluster
    }

    /// Single node owning every slot, as a standalone server would
    pub fn standalone(node: &Endpoint) -> Self {
        Self::with_masters(std::slice::from_ref(node))
    }

    pub fn connector(&self) -> Arc<InMemoryConnector> {
        Arc::new(InMemoryConnector {
            state: self.state.clone(),
        })
    }

    // =========================================================================
    // Topology manipulation
    // =========================================================================

    pub fn assign_slots(&self, slots: RangeInclusive<u16>, master: &Endpoint) {
        let mut topo = self.state.topology.write();
        for slot in slots {
            topo.owners[slot as usize] = Some(master.clone());
        }
    }

    pub fn add_replica(&self, master: &Endpoint, replica: &Endpoint) {
        self.state
            .topology
            .write()
            .replicas
            .entry(master.clone())
            .or_default()
            .push(replica.clone());
    }

    /// Start migrating `slot` to `target`: the owner answers ASK from now on
    pub fn migrate_slot(&self, slot: u16, target: &Endpoint) {
        self.state
            .topology
            .write()
            .migrating
            .insert(slot, target.clone());
    }

    /// Complete a migration started by [`migrate_slot`](Self::migrate_slot)
    pub fn finish_migration(&self, slot: u16) {
        let mut topo = self.state.topology.write();
        if let Some(target) = topo.migrating.remove(&slot) {
            topo.owners[slot as usize] = Some(target);
        }
    }

    /// Reassign a slot immediately; the old owner answers MOVED
    pub fn move_slot(&self, slot: u16, new_owner: &Endpoint) {
        self.state.topology.write().owners[slot as usize] = Some(new_owner.clone());
    }

    /// Take a node offline (or bring it back). Open connections fail on next use.
    pub fn set_down(&self, node: &Endpoint, down: bool) {
        let mut topo = self.state.topology.write();
        if down {
            topo.down.insert(node.clone());
        } else {
            topo.down.remove(node);
        }
    }

    /// Delay every reply from `node`
    pub fn set_latency(&self, node: &Endpoint, latency: Duration) {
        self.state
            .topology
            .write()
            .latency
            .insert(node.clone(), latency);
    }

    pub fn register_sentinel_master(&self, name: &str, master: &Endpoint) {
        self.state
            .topology
            .write()
            .sentinel_masters
            .insert(name.to_string(), master.clone());
    }

    pub fn slot_owner(&self, slot: u16) -> Option<Endpoint> {
        self.state.topology.read().owners[slot as usize].clone()
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Number of `verb` commands served (or redirected) by `node`
    pub fn served(&self, node: &Endpoint, verb: &str) -> usize {
        self.state
            .log
            .lock()
            .iter()
            .filter(|(ep, v)| ep == node && v.eq_ignore_ascii_case(verb))
            .count()
    }

    pub fn clear_log(&self) {
        self.state.log.lock().clear();
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(AtomicOrdering::Relaxed)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.state.keyspace.lock().live(key).is_some()
    }

    pub fn flush(&self) {
        self.state.keyspace.lock().entries.clear();
    }
}

impl ClusterState {
    fn is_down(&self, node: &Endpoint) -> bool {
        self.topology.read().down.contains(node)
    }

    fn latency(&self, node: &Endpoint) -> Option<Duration> {
        self.topology.read().latency.get(node).copied()
    }

    fn handle(&self, node: &Endpoint, session: &mut Session, command: &Command) -> Reply {
        let verb = command.verb().to_ascii_uppercase();
        self.log.lock().push((node.clone(), verb.clone()));
        let args = &command.parts()[1..];

        match verb.as_str() {
            "PING" => Reply::Status("PONG".into()),
            "ASKING" => {
                session.asking = true;
                ok()
            }
            "READONLY" => {
                session.readonly = true;
                ok()
            }
            "AUTH" | "SELECT" => ok(),
            "CLUSTER" => self.cluster_slots(),
            "SENTINEL" => self.sentinel_master(args),
            _ => {
                let asking = std::mem::take(&mut session.asking);
                match self.check_route(node, session.readonly, asking, &verb, args) {
                    Some(redirect) => redirect,
                    None => self.keyspace.lock().apply(&verb, args),
                }
            }
        }
    }

    /// Redirect or refuse when `node` may not serve the key in `args[0]`
    fn check_route(
        &self,
        node: &Endpoint,
        readonly_session: bool,
        asking: bool,
        verb: &str,
        args: &[Bytes],
    ) -> Option<Reply> {
        let key = args.first()?;
        let slot = hash_slot(key);
        let topo = self.topology.read();
        let Some(owner) = topo.owners[slot as usize].as_ref() else {
            return Some(Reply::Error(format!(
                "CLUSTERDOWN Hash slot {} not served",
                slot
            )));
        };

        if let Some(target) = topo.migrating.get(&slot) {
            if node == target && asking {
                return None;
            }
            if node == owner {
                return Some(Reply::Error(format!("ASK {} {}", slot, target)));
            }
        }
        if node == owner {
            return None;
        }
        let is_replica = topo
            .replicas
            .get(owner)
            .map(|r| r.contains(node))
            .unwrap_or(false);
        if is_replica && readonly_session && is_read_verb(verb) {
            return None;
        }
        Some(Reply::Error(format!("MOVED {} {}", slot, owner)))
    }

    fn cluster_slots(&self) -> Reply {
        let topo = self.topology.read();
        let mut ranges = Vec::new();
        let mut slot = 0usize;
        while slot < SLOT_COUNT as usize {
            let Some(owner) = topo.owners[slot].clone() else {
                slot += 1;
                continue;
            };
            let start = slot;
            while slot + 1 < SLOT_COUNT as usize && topo.owners[slot + 1].as_ref() == Some(&owner) {
                slot += 1;
            }
            let mut entry = vec![
                Reply::Int(start as i64),
                Reply::Int(slot as i64),
                node_reply(&owner),
            ];
            if let Some(replicas) = topo.replicas.get(&owner) {
                entry.extend(replicas.iter().map(node_reply));
            }
            ranges.push(Reply::Array(entry));
            slot += 1;
        }
        Reply::Array(ranges)
    }

    fn sentinel_master(&self, args: &[Bytes]) -> Reply {
        let Some(name) = args.get(1) else {
            return Reply::Error("ERR wrong number of arguments".into());
        };
        let name = String::from_utf8_lossy(name);
        let topo = self.topology.read();
        match topo.sentinel_masters.get(&*name) {
            Some(ep) => Reply::Array(vec![
                Reply::Bulk(Bytes::from(ep.host().to_string())),
                Reply::Bulk(Bytes::from(ep.port().to_string())),
            ]),
            None => Reply::Nil,
        }
    }
}

fn node_reply(node: &Endpoint) -> Reply {
    Reply::Array(vec![
        Reply::Bulk(Bytes::from(node.host().to_string())),
        Reply::Int(node.port() as i64),
    ])
}

fn is_read_verb(verb: &str) -> bool {
    matches!(
        verb,
        "GET" | "HGET" | "HGETALL" | "ZRANGE" | "ZRANGEBYSCORE" | "ZCARD" | "EXISTS" | "TTL"
    )
}

fn ok() -> Reply {
    Reply::Status("OK".into())
}

fn syntax_error() -> Reply {
    Reply::Error("ERR syntax error".into())
}

fn wrong_type() -> Reply {
    Reply::Error("WRONGTYPE Operation against a key holding the wrong kind of value".into())
}

// =============================================================================
// Keyspace
// =============================================================================

#[derive(Default)]
struct Keyspace {
    entries: HashMap<Bytes, Entry>,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Str(Bytes),
    Hash(HashMap<Bytes, Bytes>),
    ZSet(SortedSet),
}

impl Keyspace {
    fn live(&mut self, key: &[u8]) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at <= Instant::now())
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn apply(&mut self, verb: &str, args: &[Bytes]) -> Reply {
        match (verb, args) {
            ("GET", [key]) => match self.live(key).map(|e| &e.value) {
                None => Reply::Nil,
                Some(Value::Str(v)) => Reply::Bulk(v.clone()),
                Some(_) => wrong_type(),
            },
            ("SET", [key, value]) => {
                self.put_str(key, value.clone(), None);
                ok()
            }
            ("SETEX", [key, seconds, value]) => match parse_u64(seconds) {
                Some(secs) if secs > 0 => {
                    let at = Instant::now() + Duration::from_secs(secs);
                    self.put_str(key, value.clone(), Some(at));
                    ok()
                }
                _ => Reply::Error("ERR invalid expire time in 'setex' command".into()),
            },
            ("DEL", keys) if !keys.is_empty() => {
                let mut removed = 0;
                for key in keys {
                    if self.live(key).is_some() {
                        self.entries.remove(key);
                        removed += 1;
                    }
                }
                Reply::Int(removed)
            }
            ("INCR", [key]) => self.add(key, 1),
            ("DECR", [key]) => self.add(key, -1),
            ("EXPIRE", [key, seconds]) => match (parse_u64(seconds), self.live(key)) {
                (None, _) => syntax_error(),
                (Some(_), None) => Reply::Int(0),
                (Some(secs), Some(entry)) => {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(secs));
                    Reply::Int(1)
                }
            },
            ("HGET", [key, field]) => match self.live(key).map(|e| &e.value) {
                None => Reply::Nil,
                Some(Value::Hash(h)) => h.get(field).cloned().map(Reply::Bulk).unwrap_or(Reply::Nil),
                Some(_) => wrong_type(),
            },
            ("HSET", [key, field, value]) => {
                if self.live(key).is_none() {
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: Value::Hash(HashMap::new()),
                            expires_at: None,
                        },
                    );
                }
                match self.entries.get_mut(key).map(|e| &mut e.value) {
                    Some(Value::Hash(h)) => {
                        Reply::Int(h.insert(field.clone(), value.clone()).is_none() as i64)
                    }
                    _ => wrong_type(),
                }
            }
            ("HDEL", [key, field]) => {
                let (reply, now_empty) = match self.live(key).map(|e| &mut e.value) {
                    None => (Reply::Int(0), false),
                    Some(Value::Hash(h)) => {
                        let removed = h.remove(field).is_some();
                        (Reply::Int(removed as i64), h.is_empty())
                    }
                    Some(_) => (wrong_type(), false),
                };
                if now_empty {
                    self.entries.remove(key);
                }
                reply
            }
            ("HGETALL", [key]) => match self.live(key).map(|e| &e.value) {
                None => Reply::Array(Vec::new()),
                Some(Value::Hash(h)) => Reply::Array(
                    h.iter()
                        .flat_map(|(f, v)| [Reply::Bulk(f.clone()), Reply::Bulk(v.clone())])
                        .collect(),
                ),
                Some(_) => wrong_type(),
            },
            ("ZADD", [key, score, member]) => {
                let Some(score) = parse_f64(score) else {
                    return Reply::Error("ERR value is not a valid float".into());
                };
                if self.live(key).is_none() {
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: Value::ZSet(SortedSet::default()),
                            expires_at: None,
                        },
                    );
                }
                match self.entries.get_mut(key).map(|e| &mut e.value) {
                    Some(Value::ZSet(z)) => Reply::Int(z.insert(member.clone(), score) as i64),
                    _ => wrong_type(),
                }
            }
            ("ZRANGE", [key, start, stop]) => match (parse_i64(start), parse_i64(stop)) {
                (Some(start), Some(stop)) => self.with_zset(key, |z| z.range(start, stop)),
                _ => syntax_error(),
            },
            ("ZRANGEBYSCORE", [key, min, max]) => match (parse_f64(min), parse_f64(max)) {
                (Some(min), Some(max)) => self.with_zset(key, |z| z.range_by_score(min, max)),
                _ => Reply::Error("ERR min or max is not a float".into()),
            },
            ("ZREM", [key, member]) => {
                let (reply, now_empty) = match self.live(key).map(|e| &mut e.value) {
                    None => (Reply::Int(0), false),
                    Some(Value::ZSet(z)) => {
                        let removed = z.remove(member);
                        (Reply::Int(removed as i64), z.is_empty())
                    }
                    Some(_) => (wrong_type(), false),
                };
                if now_empty {
                    self.entries.remove(key);
                }
                reply
            }
            ("ZCARD", [key]) => match self.live(key).map(|e| &e.value) {
                None => Reply::Int(0),
                Some(Value::ZSet(z)) => Reply::Int(z.len() as i64),
                Some(_) => wrong_type(),
            },
            _ => Reply::Error(format!("ERR unknown command or arity '{}'", verb)),
        }
    }

    fn put_str(&mut self, key: &Bytes, value: Bytes, expires_at: Option<Instant>) {
        self.entries.insert(
            key.clone(),
            Entry {
                value: Value::Str(value),
                expires_at,
            },
        );
    }

    fn add(&mut self, key: &Bytes, delta: i64) -> Reply {
        let (current, expires_at) = match self.live(key) {
            None => (0, None),
            Some(Entry {
                value: Value::Str(v),
                expires_at,
            }) => match parse_i64(v) {
                Some(n) => (n, *expires_at),
                None => return Reply::Error("ERR value is not an integer or out of range".into()),
            },
            Some(_) => return wrong_type(),
        };
        let Some(next) = current.checked_add(delta) else {
            return Reply::Error("ERR increment or decrement would overflow".into());
        };
        self.put_str(key, Bytes::from(next.to_string()), expires_at);
        Reply::Int(next)
    }

    fn with_zset(&mut self, key: &[u8], f: impl FnOnce(&SortedSet) -> Vec<Bytes>) -> Reply {
        match self.live(key).map(|e| &e.value) {
            None => Reply::Array(Vec::new()),
            Some(Value::ZSet(z)) => Reply::Array(f(z).into_iter().map(Reply::Bulk).collect()),
            Some(_) => wrong_type(),
        }
    }
}

fn parse_u64(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn parse_i64(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn parse_f64(raw: &[u8]) -> Option<f64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

#[derive(Clone)]
struct Scored {
    score: f64,
    member: Bytes,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.member.cmp(&other.member))
    }
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<Bytes, f64>,
    order: BTreeSet<Scored>,
}

impl SortedSet {
    /// Returns true when `member` is new
    fn insert(&mut self, member: Bytes, score: f64) -> bool {
        let previous = self.scores.insert(member.clone(), score);
        if let Some(old) = previous {
            self.order.remove(&Scored {
                score: old,
                member: member.clone(),
            });
        }
        self.order.insert(Scored { score, member });
        previous.is_none()
    }

    fn remove(&mut self, member: &Bytes) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.order.remove(&Scored {
                score,
                member: member.clone(),
            }),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    fn range(&self, start: i64, stop: i64) -> Vec<Bytes> {
        let len = self.len() as i64;
        let start = if start < 0 { (start + len).max(0) } else { start };
        let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Vec::new();
        }
        self.order
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|s| s.member.clone())
            .collect()
    }

    fn range_by_score(&self, min: f64, max: f64) -> Vec<Bytes> {
        self.order
            .iter()
            .filter(|s| s.score >= min && s.score <= max)
            .map(|s| s.member.clone())
            .collect()
    }
}

// =============================================================================
// Connector / Connection
// =============================================================================

/// Connector bound to an [`InMemoryCluster`]
pub struct InMemoryConnector {
    state: Arc<ClusterState>,
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        if self.state.is_down(endpoint) {
            return Err(Error::connection(endpoint, "connection refused"));
        }
        self.state
            .connections_opened
            .fetch_add(1, AtomicOrdering::Relaxed);
        Ok(Box::new(InMemoryConnection {
            state: self.state.clone(),
            endpoint: endpoint.clone(),
            session: Session::default(),
            broken: false,
        }))
    }
}

#[derive(Default)]
struct Session {
    asking: bool,
    readonly: bool,
}

struct InMemoryConnection {
    state: Arc<ClusterState>,
    endpoint: Endpoint,
    session: Session,
    broken: bool,
}

#[async_trait]
impl Connection for InMemoryConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(&mut self, command: &Command) -> Result<Reply> {
        if let Some(delay) = self.state.latency(&self.endpoint) {
            tokio::time::sleep(delay).await;
        }
        if self.broken || self.state.is_down(&self.endpoint) {
            self.broken = true;
            return Err(Error::connection(&self.endpoint, "connection reset"));
        }
        Ok(self.state.handle(&self.endpoint, &mut self.session, command))
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}
