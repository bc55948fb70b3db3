//! Local member directory
//!
//! The directory is the single source of truth for the local view of the
//! cluster. Reads are lock-free and may happen from any task; mutations are
//! only issued by the owning protocol's sequencing task.

use crate::member::{Member, MemberId, MemberState, Properties};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::time::Instant;

/// Mutable record for a single member
#[derive(Debug, Clone)]
pub struct MemberRecord {
    member: Member,
    updated: Instant,
}

impl MemberRecord {
    pub fn new(member: Member) -> Self {
        Self {
            member,
            updated: Instant::now(),
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.member.id
    }

    pub fn state(&self) -> MemberState {
        self.member.state
    }

    pub fn incarnation(&self) -> u64 {
        self.member.incarnation
    }

    pub fn version(&self) -> Option<&str> {
        self.member.version.as_deref()
    }

    pub fn properties(&self) -> &Properties {
        &self.member.properties
    }

    /// Time of the last local state transition
    pub fn updated(&self) -> Instant {
        self.updated
    }

    /// Set the state, refreshing the transition time when it changes.
    /// Returns the previous state.
    pub fn set_state(&mut self, state: MemberState) -> MemberState {
        let previous = self.member.state;
        if previous != state {
            self.member.state = state;
            self.updated = Instant::now();
        }
        previous
    }

    /// Raise the incarnation number. Lower values are never applied.
    pub fn set_incarnation(&mut self, incarnation: u64) {
        debug_assert!(
            incarnation >= self.member.incarnation,
            "incarnation of {} would decrease",
            self.member.id
        );
        self.member.incarnation = self.member.incarnation.max(incarnation);
    }

    /// Replace properties, returning whether they changed
    pub fn set_properties(&mut self, properties: Properties) -> bool {
        if self.member.properties == properties {
            return false;
        }
        self.member.properties = properties;
        true
    }

    /// Immutable snapshot of this record
    pub fn copy(&self) -> Member {
        self.member.clone()
    }
}

/// Concurrent map of member records plus the randomized peer pool
#[derive(Debug, Default)]
pub struct MemberDirectory {
    members: DashMap<MemberId, MemberRecord>,
    pool: Mutex<Vec<MemberId>>,
    local: RwLock<Option<MemberId>>,
}

impl MemberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the local member's record. It is never part of the peer pool.
    pub fn set_local(&self, member: Member) {
        let id = member.id.clone();
        self.members.insert(id.clone(), MemberRecord::new(member));
        *self.local.write().unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    pub fn local_id(&self) -> Option<MemberId> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn local(&self) -> Option<Member> {
        self.local_id().and_then(|id| self.get(&id))
    }

    pub fn get(&self, id: &MemberId) -> Option<Member> {
        self.members.get(id).map(|record| record.copy())
    }

    pub fn get_all(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.iter().map(|r| r.copy()).collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    /// Snapshot of every record together with its last transition time
    pub fn records(&self) -> Vec<(Member, Instant)> {
        self.members
            .iter()
            .map(|record| (record.copy(), record.updated()))
            .collect()
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Insert a remote member and add it to the peer pool
    pub fn insert<R: Rng + ?Sized>(&self, member: Member, rng: &mut R) {
        let id = member.id.clone();
        self.members.insert(id.clone(), MemberRecord::new(member));

        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if !pool.contains(&id) {
            pool.push(id);
        }
        pool.shuffle(rng);
    }

    /// Remove a member from the map and the peer pool
    pub fn remove(&self, id: &MemberId) -> Option<MemberRecord> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|pooled| pooled != id);
        self.members.remove(id).map(|(_, record)| record)
    }

    /// Apply a mutation to a record in place
    pub fn update<F, R>(&self, id: &MemberId, f: F) -> Option<R>
    where
        F: FnOnce(&mut MemberRecord) -> R,
    {
        self.members.get_mut(id).map(|mut record| f(&mut record))
    }

    /// Peer pool in its current randomized order
    pub fn pool(&self) -> Vec<Member> {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        pool.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Up to `count` random peers, skipping the given ids
    pub fn random_members<R: Rng + ?Sized>(
        &self,
        count: usize,
        exclude: &[&MemberId],
        rng: &mut R,
    ) -> Vec<Member> {
        let mut candidates: Vec<Member> = self
            .pool()
            .into_iter()
            .filter(|member| !exclude.contains(&&member.id))
            .collect();
        candidates.shuffle(rng);
        candidates.truncate(count);
        candidates
    }

    /// Drop every record, the pool and the local identity
    pub fn clear(&self) {
        self.members.clear();
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.local.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn member(id: &str, port: u16) -> Member {
        Member::new(id, format!("127.0.0.1:{}", port).parse().unwrap())
    }

    #[test]
    fn test_local_member_not_pooled() {
        let directory = MemberDirectory::new();
        let mut rng = StdRng::seed_from_u64(1);

        directory.set_local(member("local", 5000));
        directory.insert(member("a", 5001), &mut rng);
        directory.insert(member("b", 5002), &mut rng);

        assert_eq!(directory.len(), 3);
        assert_eq!(directory.local_id(), Some(MemberId::new("local")));
        let pooled: Vec<MemberId> = directory.pool().into_iter().map(|m| m.id).collect();
        assert_eq!(pooled.len(), 2);
        assert!(!pooled.contains(&MemberId::new("local")));
    }

    #[test]
    fn test_insert_replaces_record_without_duplicating_pool() {
        let directory = MemberDirectory::new();
        let mut rng = StdRng::seed_from_u64(1);

        directory.insert(member("a", 5001), &mut rng);
        directory.insert(member("a", 5001).with_version("2"), &mut rng);

        assert_eq!(directory.len(), 1);
        assert_eq!(directory.pool().len(), 1);
        assert_eq!(
            directory.get(&MemberId::new("a")).unwrap().version.as_deref(),
            Some("2")
        );
    }

    #[test]
    fn test_remove_drops_from_pool() {
        let directory = MemberDirectory::new();
        let mut rng = StdRng::seed_from_u64(7);

        directory.insert(member("a", 5001), &mut rng);
        directory.insert(member("b", 5002), &mut rng);
        assert!(directory.remove(&MemberId::new("a")).is_some());
        assert!(directory.remove(&MemberId::new("a")).is_none());

        assert!(!directory.contains(&MemberId::new("a")));
        assert_eq!(directory.pool().len(), 1);
    }

    #[test]
    fn test_random_members_respects_exclusions() {
        let directory = MemberDirectory::new();
        let mut rng = StdRng::seed_from_u64(3);
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            directory.insert(member(id, 5001 + i as u16), &mut rng);
        }

        let excluded = MemberId::new("b");
        for _ in 0..20 {
            let picked = directory.random_members(2, &[&excluded], &mut rng);
            assert_eq!(picked.len(), 2);
            assert!(picked.iter().all(|m| m.id != excluded));
        }

        assert_eq!(directory.random_members(10, &[], &mut rng).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_refreshes_updated() {
        let directory = MemberDirectory::new();
        let mut rng = StdRng::seed_from_u64(1);
        let id = MemberId::new("a");
        directory.insert(member("a", 5001), &mut rng);

        let before = directory.records()[0].1;
        tokio::time::advance(std::time::Duration::from_secs(1)).await;

        // Same state does not count as a transition
        directory.update(&id, |record| record.set_state(MemberState::Alive));
        assert_eq!(directory.records()[0].1, before);

        let previous = directory.update(&id, |record| record.set_state(MemberState::Suspect));
        assert_eq!(previous, Some(MemberState::Alive));
        assert!(directory.records()[0].1 > before);
    }

    #[test]
    fn test_record_mutations() {
        let mut record = MemberRecord::new(member("a", 5001));
        record.set_incarnation(5);
        assert_eq!(record.incarnation(), 5);

        let mut properties = Properties::new();
        properties.insert("role".into(), "broker".into());
        assert!(record.set_properties(properties.clone()));
        assert!(!record.set_properties(properties));
        assert_eq!(record.copy().properties.len(), 1);
    }

    #[test]
    fn test_clear() {
        let directory = MemberDirectory::new();
        let mut rng = StdRng::seed_from_u64(1);
        directory.set_local(member("local", 5000));
        directory.insert(member("a", 5001), &mut rng);

        directory.clear();
        assert!(directory.is_empty());
        assert!(directory.pool().is_empty());
        assert!(directory.local().is_none());
    }
}
