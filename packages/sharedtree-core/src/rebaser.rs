//! Rebasing of commits and branches, and the edit manager that keeps the local branch on
//! top of the sequenced trunk.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::change::{ChangeFamily, ModularChangeset, RevisionMetadata, TaggedChange};
use crate::delta::Root;
use crate::error::{Error, Result};
use crate::ids::{RevisionTag, SessionId};

/// Marks revisions minted for rollbacks so their ids never meet a real revision's.
const ROLLBACK_BIT: u64 = 1 << 63;

#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    pub revision: RevisionTag,
    pub change: ModularChangeset,
}

impl Commit {
    pub fn new(revision: RevisionTag, change: ModularChangeset) -> Self {
        Self { revision, change }
    }

    pub fn session(&self) -> SessionId {
        self.revision.session
    }

    fn tagged(&self) -> TaggedChange {
        TaggedChange::new(Some(self.revision), self.change.clone())
    }
}

fn rollback_tag(revision: RevisionTag) -> RevisionTag {
    RevisionTag::new(revision.session, revision.seq | ROLLBACK_BIT)
}

/// Rebases `change` over each of `over` in turn. `over` must be a contiguous history.
pub fn rebase_change_over_changes(
    family: &ChangeFamily,
    change: &TaggedChange,
    over: &[Commit],
    metadata: &RevisionMetadata,
) -> Result<ModularChangeset> {
    let mut rebased = change.clone();
    for base in over {
        rebased.change = family.rebase(&rebased, &base.tagged(), metadata)?;
    }
    Ok(rebased.change)
}

/// Moves `branch` from its base onto the end of `onto`, which continues from that same base.
///
/// A branch commit met again on `onto` (same revision) has been sequenced: it leaves the
/// branch and later branch commits stay as they are relative to it.
pub fn rebase_branch(
    family: &ChangeFamily,
    branch: &[Commit],
    onto: &[Commit],
    metadata: &RevisionMetadata,
) -> Result<Vec<Commit>> {
    let mut branch = branch.to_vec();
    for base in onto {
        match branch.first() {
            Some(first) if first.revision == base.revision => {
                branch.remove(0);
            }
            _ => branch = rebase_branch_over(family, &branch, base, metadata)?,
        }
    }
    Ok(branch)
}

/// Sandwich rebase: commit `i` is rebased over
/// `inverse(b[i-1]) ... inverse(b[0]), base, b'[0] ... b'[i-1]`.
fn rebase_branch_over(
    family: &ChangeFamily,
    branch: &[Commit],
    base: &Commit,
    metadata: &RevisionMetadata,
) -> Result<Vec<Commit>> {
    let mut inverses: Vec<TaggedChange> = Vec::with_capacity(branch.len());
    let mut rebased: Vec<Commit> = Vec::with_capacity(branch.len());
    for commit in branch {
        let over = if rebased.is_empty() {
            base.change.clone()
        } else {
            let sandwich: Vec<TaggedChange> = inverses
                .iter()
                .rev()
                .cloned()
                .chain(std::iter::once(base.tagged()))
                .chain(rebased.iter().map(Commit::tagged))
                .collect();
            family.compose(&sandwich, metadata)?
        };
        let over = TaggedChange::new(Some(base.revision), over);
        let change = family.rebase(&commit.tagged(), &over, metadata)?;
        trace!(revision = %commit.revision, over = %base.revision, "rebased branch commit");
        let rollback = rollback_tag(commit.revision);
        inverses.push(TaggedChange::new(
            Some(rollback),
            family.invert(&commit.tagged(), true, Some(rollback))?,
        ));
        rebased.push(Commit::new(commit.revision, change));
    }
    Ok(rebased)
}

#[derive(Clone, Debug, PartialEq)]
struct TrunkCommit {
    seq: u64,
    commit: Commit,
}

/// A peer's commits that are not yet below its reference point, relative to the trunk at
/// `base_seq`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeerBranch {
    pub base_seq: u64,
    pub commits: Vec<Commit>,
}

/// Tracks the sequenced trunk, the local branch and each peer's branch.
#[derive(Debug)]
pub struct EditManager {
    family: ChangeFamily,
    session: SessionId,
    next_local_seq: u64,
    trunk: Vec<TrunkCommit>,
    /// Sequence number of the oldest trunk state still reconstructible.
    trunk_base_seq: u64,
    local: Vec<Commit>,
    peers: BTreeMap<SessionId, PeerBranch>,
    metadata: RevisionMetadata,
}

impl EditManager {
    pub fn new(family: ChangeFamily, session: SessionId) -> Self {
        Self {
            family,
            session,
            next_local_seq: 0,
            trunk: Vec::new(),
            trunk_base_seq: 0,
            local: Vec::new(),
            peers: BTreeMap::new(),
            metadata: RevisionMetadata::new(),
        }
    }

    pub fn family(&self) -> &ChangeFamily {
        &self.family
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Sequence number of the trunk head; the reference point for new local commits.
    pub fn head_seq(&self) -> u64 {
        self.trunk.last().map_or(self.trunk_base_seq, |c| c.seq)
    }

    pub fn local_commits(&self) -> &[Commit] {
        &self.local
    }

    pub fn trunk_len(&self) -> usize {
        self.trunk.len()
    }

    pub fn peer_branch(&self, session: SessionId) -> Option<&PeerBranch> {
        self.peers.get(&session)
    }

    pub fn metadata(&self) -> &RevisionMetadata {
        &self.metadata
    }

    /// Commits a local change on top of the local branch and returns it as sent to peers.
    pub fn add_local_change(&mut self, change: ModularChangeset) -> Result<Commit> {
        self.next_local_seq += 1;
        let revision = RevisionTag::new(self.session, self.next_local_seq);
        let change = self
            .family
            .tag(&TaggedChange::new(Some(revision), change))?;
        let commit = Commit::new(revision, change);
        self.local.push(commit.clone());
        debug!(%revision, pending = self.local.len(), "local commit added");
        Ok(commit)
    }

    /// Appends a sequenced commit to the trunk.
    ///
    /// `commit` is as its author sent it: relative to the trunk at `ref_seq` followed by the
    /// author's own earlier commits. Returns the deltas that bring the local view (trunk plus
    /// local branch) up to date, to be applied in order.
    pub fn add_sequenced_change(
        &mut self,
        commit: Commit,
        seq: u64,
        ref_seq: u64,
    ) -> Result<Vec<Root>> {
        if seq <= self.head_seq() {
            return Err(Error::InconsistentState(format!(
                "sequence number {seq} does not follow trunk head {}",
                self.head_seq()
            )));
        }
        if ref_seq < self.trunk_base_seq || ref_seq > self.head_seq() {
            return Err(Error::InconsistentState(format!(
                "reference sequence number {ref_seq} is outside the retained trunk"
            )));
        }
        self.metadata.insert(commit.revision, seq);

        if commit.session() == self.session {
            return self.sequence_local(commit, seq);
        }

        let rebased = self.rebase_peer_commit(commit.clone(), ref_seq)?;
        debug!(revision = %commit.revision, seq, ref_seq, "peer commit sequenced");
        let trunk_commit = Commit::new(commit.revision, rebased);
        let deltas = self.rebase_local_branch(&trunk_commit)?;
        self.trunk.push(TrunkCommit {
            seq,
            commit: trunk_commit,
        });
        Ok(deltas)
    }

    fn sequence_local(&mut self, commit: Commit, seq: u64) -> Result<Vec<Root>> {
        match self.local.first() {
            Some(first) if first.revision == commit.revision => {
                let commit = self.local.remove(0);
                debug!(revision = %commit.revision, seq, "local commit sequenced");
                self.trunk.push(TrunkCommit { seq, commit });
                Ok(Vec::new())
            }
            _ => Err(Error::InconsistentState(format!(
                "local commit {} sequenced out of order",
                commit.revision
            ))),
        }
    }

    fn trunk_after(&self, from_seq: u64, to_seq: u64) -> Vec<Commit> {
        self.trunk
            .iter()
            .filter(|c| c.seq > from_seq && c.seq <= to_seq)
            .map(|c| c.commit.clone())
            .collect()
    }

    /// Brings the author's branch up to `ref_seq`, appends `commit`, and rebases the branch
    /// to the trunk head, where only `commit` remains.
    fn rebase_peer_commit(&mut self, commit: Commit, ref_seq: u64) -> Result<ModularChangeset> {
        let session = commit.session();
        let mut peer = self.peers.remove(&session).unwrap_or(PeerBranch {
            base_seq: ref_seq,
            commits: Vec::new(),
        });
        if peer.base_seq < self.trunk_base_seq {
            return Err(Error::InconsistentState(format!(
                "branch of {session} starts before the retained trunk"
            )));
        }
        if ref_seq > peer.base_seq {
            let segment = self.trunk_after(peer.base_seq, ref_seq);
            peer.commits = rebase_branch(&self.family, &peer.commits, &segment, &self.metadata)?;
            peer.base_seq = ref_seq;
        }
        peer.commits.push(commit.clone());

        let segment = self.trunk_after(peer.base_seq, self.head_seq());
        let mut at_head = rebase_branch(&self.family, &peer.commits, &segment, &self.metadata)?;
        self.peers.insert(session, peer);
        match (at_head.pop(), at_head.is_empty()) {
            (Some(rebased), true) if rebased.revision == commit.revision => Ok(rebased.change),
            _ => Err(Error::InconsistentState(format!(
                "commits of {session} before {} are missing from the trunk",
                commit.revision
            ))),
        }
    }

    /// Rebases the local branch over a new trunk commit. The returned deltas roll the old
    /// branch back, apply the trunk commit, then apply the rebased branch.
    fn rebase_local_branch(&mut self, trunk_commit: &Commit) -> Result<Vec<Root>> {
        let mut deltas = Vec::with_capacity(2 * self.local.len() + 1);
        for commit in self.local.iter().rev() {
            let inverse = self
                .family
                .invert(&commit.tagged(), true, Some(rollback_tag(commit.revision)))?;
            deltas.push(self.family.into_delta(&inverse)?);
        }
        deltas.push(self.delta_of(trunk_commit)?);
        let rebased = rebase_branch_over(&self.family, &self.local, trunk_commit, &self.metadata)?;
        for commit in &rebased {
            deltas.push(self.delta_of(commit)?);
        }
        self.local = rebased;
        Ok(deltas)
    }

    fn delta_of(&self, commit: &Commit) -> Result<Root> {
        let tagged = self.family.tag(&commit.tagged())?;
        self.family.into_delta(&tagged)
    }

    /// Forgets trunk history at or below `min_seq`; no peer may reference it any more.
    /// Peer branches based below `min_seq` are first moved up to it.
    pub fn advance_minimum_sequence_number(&mut self, min_seq: u64) -> Result<()> {
        if min_seq <= self.trunk_base_seq {
            return Ok(());
        }
        let min_seq = min_seq.min(self.head_seq());
        for peer in self.peers.values_mut() {
            if peer.base_seq < min_seq {
                let segment: Vec<Commit> = self
                    .trunk
                    .iter()
                    .filter(|c| c.seq > peer.base_seq && c.seq <= min_seq)
                    .map(|c| c.commit.clone())
                    .collect();
                peer.commits = rebase_branch(&self.family, &peer.commits, &segment, &self.metadata)?;
                peer.base_seq = min_seq;
            }
        }
        self.peers.retain(|_, peer| !peer.commits.is_empty());
        self.trunk.retain(|c| c.seq > min_seq);
        self.trunk_base_seq = min_seq;
        debug!(min_seq, retained = self.trunk.len(), "trunk trimmed");
        Ok(())
    }
}
