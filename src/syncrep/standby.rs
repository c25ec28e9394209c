// Standby groups and replication senders.
//
// The standby group tree describes which replica acknowledgements the
// primary waits for. With the priority method, the sync list is the first
// `wait_num` active standbys in member order; a `*` member admits any
// still-unlisted active standby. The safe write/flush LSNs are the minima
// over the sync list, and `none` while fewer than `wait_num` standbys
// qualify.
//
// Sender slots carry the per-standby progress a sender reports as it
// streams; they are read under the syncrep lock when waiters are released.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::{Lsn, INVALID_LSN};
use crate::error::{FedXactError, Result};

// ============================================================================
// Standby group tree
// ============================================================================

/// Quorum method of a group node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumMethod {
    /// First `wait_num` active members in list order.
    Priority,
}

/// One member of a standby group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StandbyNode {
    /// A named standby, matched against the sender's reported name.
    Name(String),
    /// The wildcard: any active standby not already in the sync list.
    Any,
    /// A nested group; contributes its own synced LSNs as one member.
    Group(StandbyGroup),
}

/// A group node: quorum method, how many members must qualify, and the
/// ordered member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandbyGroup {
    pub method: QuorumMethod,
    pub wait_num: usize,
    pub members: Vec<StandbyNode>,
}

impl StandbyGroup {
    pub fn priority(wait_num: usize, members: Vec<StandbyNode>) -> Self {
        Self {
            method: QuorumMethod::Priority,
            wait_num,
            members,
        }
    }
}

/// Builds the standby group tree from the configured specification.
///
/// Accepted forms: a bare comma-separated list (`s1, s2`, wait_num 1), the
/// explicit `FIRST n (s1, s2, *)`, or `n (s1, s2)`. An empty string means
/// no synchronous standbys. The full grammar of the host syntax is out of
/// scope; the tree type is the contract for anything richer.
pub fn parse_standby_names(input: &str) -> Result<Option<StandbyGroup>> {
    let spec = input.trim();
    if spec.is_empty() {
        return Ok(None);
    }

    let (wait_num, list) = match split_prefixed_count(spec)? {
        Some(parts) => parts,
        None => (1, spec),
    };

    let mut members = Vec::new();
    for token in list.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(FedXactError::config(format!(
                "empty member in synchronous_standby_names: {input:?}"
            )));
        }
        members.push(if token == "*" {
            StandbyNode::Any
        } else {
            StandbyNode::Name(token.to_string())
        });
    }

    if wait_num == 0 || wait_num > members.len() {
        return Err(FedXactError::config(format!(
            "wait_num {wait_num} is outside 1..={} for synchronous_standby_names {input:?}",
            members.len()
        )));
    }
    Ok(Some(StandbyGroup::priority(wait_num, members)))
}

/// Splits `FIRST n (list)` / `n (list)` into `(n, list)`; `Ok(None)` when
/// the spec is a bare list.
fn split_prefixed_count(spec: &str) -> Result<Option<(usize, &str)>> {
    let rest = match spec.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("first") => spec[5..].trim_start(),
        _ => spec,
    };
    if !rest.starts_with(|c: char| c.is_ascii_digit()) {
        return Ok(None);
    }
    let open = rest.find('(').ok_or_else(|| {
        FedXactError::config(format!("expected parenthesized member list in {spec:?}"))
    })?;
    let count: usize = rest[..open].trim().parse().map_err(|_| {
        FedXactError::config(format!("bad wait_num in synchronous_standby_names {spec:?}"))
    })?;
    let inner = rest[open + 1..].trim_end();
    let inner = inner.strip_suffix(')').ok_or_else(|| {
        FedXactError::config(format!("unterminated member list in {spec:?}"))
    })?;
    Ok(Some((count, inner)))
}

// ============================================================================
// Replication senders
// ============================================================================

/// Streaming state of a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalSenderState {
    Startup,
    Streaming,
    Stopping,
}

/// One sender slot: the standby it serves and its reported progress.
#[derive(Debug, Clone)]
pub struct WalSenderSlot {
    /// Worker token; zero when the slot is free.
    pub pid: u64,
    /// Name the standby registered under.
    pub name: String,
    pub state: WalSenderState,
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
}

impl WalSenderSlot {
    fn empty() -> Self {
        Self {
            pid: 0,
            name: String::new(),
            state: WalSenderState::Startup,
            write_lsn: INVALID_LSN,
            flush_lsn: INVALID_LSN,
        }
    }

    /// A standby counts toward the sync list only while it is streaming
    /// with a valid flush position.
    pub fn is_active(&self) -> bool {
        self.pid != 0 && self.state == WalSenderState::Streaming && self.flush_lsn != INVALID_LSN
    }
}

/// Fixed array of sender slots.
pub struct WalSenderArray {
    slots: Box<[Mutex<WalSenderSlot>]>,
    next_pid: AtomicU64,
}

impl WalSenderArray {
    pub fn new(max_wal_senders: usize) -> Self {
        let mut slots = Vec::with_capacity(max_wal_senders);
        slots.resize_with(max_wal_senders, || Mutex::new(WalSenderSlot::empty()));
        Self {
            slots: slots.into_boxed_slice(),
            next_pid: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims a slot for a sender serving the named standby. Returns the
    /// slot index used for progress updates.
    pub fn register(&self, name: &str) -> Result<usize> {
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.pid != 0 {
                continue;
            }
            slot.pid = self.next_pid.fetch_add(1, Ordering::AcqRel);
            slot.name = name.to_string();
            slot.state = WalSenderState::Startup;
            slot.write_lsn = INVALID_LSN;
            slot.flush_lsn = INVALID_LSN;
            return Ok(idx);
        }
        Err(FedXactError::SlotExhausted { kind: "wal sender" })
    }

    /// Updates a sender's streaming state and reported progress.
    pub fn set_progress(&self, idx: usize, state: WalSenderState, write_lsn: Lsn, flush_lsn: Lsn) {
        let mut slot = self.slots[idx].lock();
        slot.state = state;
        slot.write_lsn = write_lsn;
        slot.flush_lsn = flush_lsn;
    }

    /// Frees a slot when its sender exits.
    pub fn release(&self, idx: usize) {
        *self.slots[idx].lock() = WalSenderSlot::empty();
    }

    /// Clones all slots for evaluation.
    pub fn snapshot(&self) -> Vec<WalSenderSlot> {
        self.slots.iter().map(|slot| slot.lock().clone()).collect()
    }
}

impl std::fmt::Debug for WalSenderArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalSenderArray")
            .field("capacity", &self.capacity())
            .finish()
    }
}

// ============================================================================
// Priority evaluation
// ============================================================================

/// Computes the safe `(write, flush)` LSNs for a group against a sender
/// snapshot, or `None` while fewer than `wait_num` members qualify.
pub fn synced_lsns(group: &StandbyGroup, senders: &[WalSenderSlot]) -> Option<(Lsn, Lsn)> {
    let mut used = HashSet::new();
    eval_group(group, senders, &mut used)
}

fn eval_group(
    group: &StandbyGroup,
    senders: &[WalSenderSlot],
    used: &mut HashSet<usize>,
) -> Option<(Lsn, Lsn)> {
    let QuorumMethod::Priority = group.method;
    let mut picked: Vec<(Lsn, Lsn)> = Vec::new();

    for member in &group.members {
        if picked.len() == group.wait_num {
            break;
        }
        match member {
            StandbyNode::Name(name) => {
                if let Some(idx) = senders.iter().enumerate().position(|(i, s)| {
                    !used.contains(&i) && s.is_active() && s.name == *name
                }) {
                    used.insert(idx);
                    picked.push((senders[idx].write_lsn, senders[idx].flush_lsn));
                }
            }
            StandbyNode::Any => {
                // The wildcard admits any still-unlisted active standby,
                // as many as needed to fill the sync list.
                for (idx, sender) in senders.iter().enumerate() {
                    if picked.len() == group.wait_num {
                        break;
                    }
                    if used.contains(&idx) || !sender.is_active() {
                        continue;
                    }
                    used.insert(idx);
                    picked.push((sender.write_lsn, sender.flush_lsn));
                }
            }
            StandbyNode::Group(nested) => {
                if let Some(pair) = eval_group(nested, senders, used) {
                    picked.push(pair);
                }
            }
        }
    }

    if picked.len() < group.wait_num {
        return None;
    }
    let write = picked.iter().map(|&(w, _)| w).min()?;
    let flush = picked.iter().map(|&(_, f)| f).min()?;
    Some((write, flush))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(name: &str, state: WalSenderState, write: Lsn, flush: Lsn) -> WalSenderSlot {
        WalSenderSlot {
            pid: 1,
            name: name.to_string(),
            state,
            write_lsn: write,
            flush_lsn: flush,
        }
    }

    #[test]
    fn test_parse_empty_means_no_standbys() {
        assert_eq!(parse_standby_names("").unwrap(), None);
        assert_eq!(parse_standby_names("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_bare_list_waits_for_one() {
        let group = parse_standby_names("s1, s2").unwrap().unwrap();
        assert_eq!(group.wait_num, 1);
        assert_eq!(
            group.members,
            vec![
                StandbyNode::Name("s1".into()),
                StandbyNode::Name("s2".into())
            ]
        );
    }

    #[test]
    fn test_parse_first_n_with_wildcard() {
        let group = parse_standby_names("FIRST 2 (s1, s2, *)").unwrap().unwrap();
        assert_eq!(group.wait_num, 2);
        assert_eq!(group.members.len(), 3);
        assert_eq!(group.members[2], StandbyNode::Any);
    }

    #[test]
    fn test_parse_rejects_bad_wait_num() {
        assert!(parse_standby_names("3 (s1, s2)").is_err());
        assert!(parse_standby_names("0 (s1)").is_err());
        assert!(parse_standby_names("2 (s1, s2").is_err());
    }

    #[test]
    fn test_synced_lsns_single_standby() {
        let group = parse_standby_names("s1").unwrap().unwrap();
        let senders = vec![sender("s1", WalSenderState::Streaming, 0x200, 0x180)];
        assert_eq!(synced_lsns(&group, &senders), Some((0x200, 0x180)));
    }

    #[test]
    fn test_synced_lsns_requires_wait_num_active() {
        let group = parse_standby_names("FIRST 2 (s1, s2)").unwrap().unwrap();
        let senders = vec![sender("s1", WalSenderState::Streaming, 0x200, 0x180)];
        assert_eq!(synced_lsns(&group, &senders), None);

        let senders = vec![
            sender("s1", WalSenderState::Streaming, 0x200, 0x180),
            sender("s2", WalSenderState::Streaming, 0x300, 0x100),
        ];
        // Minima over the sync list.
        assert_eq!(synced_lsns(&group, &senders), Some((0x200, 0x100)));
    }

    #[test]
    fn test_inactive_standby_does_not_qualify() {
        let group = parse_standby_names("s1").unwrap().unwrap();
        let senders = vec![sender("s1", WalSenderState::Startup, 0x200, 0x180)];
        assert_eq!(synced_lsns(&group, &senders), None);

        let mut gone = sender("s1", WalSenderState::Streaming, 0x200, 0x180);
        gone.pid = 0;
        assert_eq!(synced_lsns(&group, &[gone]), None);

        let unflushed = sender("s1", WalSenderState::Streaming, 0x200, INVALID_LSN);
        assert_eq!(synced_lsns(&group, &[unflushed]), None);
    }

    #[test]
    fn test_wildcard_admits_unlisted_standbys() {
        let group = parse_standby_names("FIRST 2 (s1, *)").unwrap().unwrap();
        let senders = vec![
            sender("other", WalSenderState::Streaming, 0x300, 0x250),
            sender("s1", WalSenderState::Streaming, 0x200, 0x180),
        ];
        assert_eq!(synced_lsns(&group, &senders), Some((0x200, 0x180)));
    }

    #[test]
    fn test_named_member_takes_precedence_over_wildcard_slot() {
        let group = parse_standby_names("s1, *").unwrap().unwrap();
        let senders = vec![
            sender("other", WalSenderState::Streaming, 0x999, 0x999),
            sender("s1", WalSenderState::Streaming, 0x200, 0x180),
        ];
        // s1 is first in member order, so the sync list is exactly s1.
        assert_eq!(synced_lsns(&group, &senders), Some((0x200, 0x180)));
    }

    #[test]
    fn test_sender_array_register_and_release() {
        let array = WalSenderArray::new(2);
        let a = array.register("s1").unwrap();
        let b = array.register("s2").unwrap();
        assert!(matches!(
            array.register("s3"),
            Err(FedXactError::SlotExhausted { .. })
        ));

        array.set_progress(a, WalSenderState::Streaming, 0x100, 0x80);
        let snap = array.snapshot();
        assert!(snap[a].is_active());
        assert!(!snap[b].is_active());

        array.release(a);
        array.register("s3").unwrap();
    }
}
